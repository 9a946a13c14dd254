//! Basic exposure quality gate.
//!
//! Checks for saturation and absence of signal before a capture is allowed
//! to ship. Deeper quality metrics (FWHM, SNR, star elongation, cloud
//! detection) belong to the external analysis processors.

use std::collections::HashMap;
use std::time::Instant;

use crate::processors::{ImageProcessor, ProcessingContext, ProcessorResult};

/// 95 % of the 16-bit well counts as clipped.
const SATURATION_LEVEL: f64 = 65535.0 * 0.95;
/// Mean counts below this mean there is nothing in the frame.
const DARK_MEAN_LEVEL: f64 = 100.0;

pub struct QualityCheckProcessor;

impl ImageProcessor for QualityCheckProcessor {
    fn name(&self) -> &'static str {
        "quality_checker"
    }

    fn friendly_name(&self) -> &'static str {
        "Quality Checker"
    }

    fn description(&self) -> &'static str {
        "Validates image quality by checking for saturation and low signal"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> anyhow::Result<ProcessorResult> {
        let started = Instant::now();

        let pixels = match crate::fits::read_image_u16(&ctx.working_image_path) {
            Ok(pixels) if !pixels.is_empty() => pixels,
            Ok(_) => {
                // Validation problem, not a processing failure: let the
                // capture through with zero confidence.
                return Ok(self.inconclusive(started, "image has no pixels"));
            }
            Err(err) => {
                return Ok(self.inconclusive(started, &format!("unreadable image: {err:#}")));
            }
        };

        let max = pixels.iter().copied().max().unwrap_or(0) as f64;
        let count = pixels.len() as f64;
        let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / count;
        let variance = pixels.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / count;

        let mut extracted = HashMap::new();
        extracted.insert("max_pixel_value".to_string(), serde_json::json!(max));
        extracted.insert("mean_pixel_value".to_string(), serde_json::json!(mean));
        extracted.insert("std_pixel_value".to_string(), serde_json::json!(variance.sqrt()));
        if let Some(task) = &ctx.task {
            extracted.insert("satellite_name".to_string(), serde_json::json!(task.satellite_name));
            extracted.insert("task_id".to_string(), serde_json::json!(task.id));
        }

        let (should_upload, confidence, reason) = if max >= SATURATION_LEVEL {
            (false, 0.0, "Image saturated".to_string())
        } else if mean < DARK_MEAN_LEVEL {
            (false, 0.2, "Image too dark (no signal)".to_string())
        } else {
            (true, 0.9, "Image quality acceptable".to_string())
        };

        Ok(ProcessorResult {
            should_upload,
            extracted,
            confidence,
            reason,
            duration_s: started.elapsed().as_secs_f64(),
            processor_name: self.name().to_string(),
        })
    }
}

impl QualityCheckProcessor {
    fn inconclusive(&self, started: Instant, what: &str) -> ProcessorResult {
        ProcessorResult {
            should_upload: true,
            extracted: HashMap::new(),
            confidence: 0.0,
            reason: what.to_string(),
            duration_s: started.elapsed().as_secs_f64(),
            processor_name: self.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_context;

    const BLOCK: usize = 2880;

    /// Overwrite the whole data section with one raw big-endian word.
    fn fill_data(path: &std::path::Path, word: [u8; 2]) {
        let mut bytes = std::fs::read(path).unwrap();
        let data_start = bytes.len() - BLOCK;
        for pair in bytes[data_start..].chunks_exact_mut(2) {
            pair.copy_from_slice(&word);
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn run_on(word: Option<[u8; 2]>) -> ProcessorResult {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("cap.fits");
        crate::fits::write_minimal_fits(&image, 8, 8).unwrap();
        if let Some(word) = word {
            fill_data(&image, word);
        }
        let mut ctx = test_context(image, dir.path().join("work"));
        QualityCheckProcessor.process(&mut ctx).unwrap()
    }

    #[test]
    fn bias_level_frame_is_acceptable() {
        // Raw zeros sit at the 32768 bias level: neither dark nor clipped.
        let result = run_on(None);
        assert!(result.should_upload);
        assert_eq!(result.reason, "Image quality acceptable");
        assert_eq!(result.extracted["mean_pixel_value"], serde_json::json!(32768.0));
    }

    #[test]
    fn saturated_frame_is_vetoed() {
        // i16::MAX raw -> 65535 counts.
        let result = run_on(Some([0x7F, 0xFF]));
        assert!(!result.should_upload);
        assert_eq!(result.reason, "Image saturated");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn dark_frame_is_vetoed() {
        // i16::MIN raw -> 0 counts.
        let result = run_on(Some([0x80, 0x00]));
        assert!(!result.should_upload);
        assert_eq!(result.reason, "Image too dark (no signal)");
    }

    #[test]
    fn unreadable_image_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("missing.fits");
        let mut ctx = test_context(image, dir.path().join("work"));
        let result = QualityCheckProcessor.process(&mut ctx).unwrap();
        assert!(result.should_upload, "validation issues fail open");
        assert_eq!(result.confidence, 0.0);
    }
}
