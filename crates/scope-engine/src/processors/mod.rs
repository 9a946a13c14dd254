//! Image processor chain.
//!
//! Processors are stateless analyses run in order over one capture. Each
//! returns an upload decision plus extracted data; the registry folds the
//! per-processor results into one [`AggregatedResult`]. A processor error
//! propagates out so the processing queue's retry (and eventually its
//! fail-open path) engages.

pub mod quality;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use citrascope_core::settings::Settings;
use citrascope_core::task::Task;

use crate::api::{GroundStationDto, TelescopeDto};
use crate::location::SensorLocation;

/// Result of one processor over one capture.
#[derive(Debug, Clone)]
pub struct ProcessorResult {
    /// False vetoes the upload of this capture.
    pub should_upload: bool,
    /// Metrics and readings to attach to the upload.
    pub extracted: HashMap<String, serde_json::Value>,
    /// Quality score in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable explanation of the outcome.
    pub reason: String,
    pub duration_s: f64,
    pub processor_name: String,
}

/// Combined outcome of the whole chain.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    /// AND over all processor decisions.
    pub should_upload: bool,
    /// Union of extracted data, keys prefixed `{processor_name}.` so they
    /// cannot collide.
    pub extracted: HashMap<String, serde_json::Value>,
    pub results: Vec<ProcessorResult>,
    pub total_time_s: f64,
    /// First veto, as `"{name}: {reason}"`.
    pub skip_reason: Option<String>,
}

/// Everything a processor may need for one job.
///
/// Optional services are genuinely optional; processors must tolerate
/// their absence (manual captures carry no task, headless tests carry no
/// telescope record).
pub struct ProcessingContext {
    /// The original capture. Never changes.
    pub image_path: PathBuf,
    /// Current working image; processors that produce an augmented copy
    /// (e.g. a plate-solved variant) point this at their output. Always
    /// absolute.
    pub working_image_path: PathBuf,
    /// Job-scoped scratch directory for intermediate artifacts.
    pub working_dir: PathBuf,
    /// Raw file bytes, loaded once by the registry.
    pub image_data: Option<Vec<u8>>,
    pub task: Option<Arc<Task>>,
    pub telescope: Option<TelescopeDto>,
    pub ground_station: Option<GroundStationDto>,
    pub settings: Settings,
    pub location: Option<SensorLocation>,
}

/// A single stateless analysis stage.
pub trait ImageProcessor: Send + Sync {
    /// Stable identifier, also the `extracted` key namespace.
    fn name(&self) -> &'static str;
    fn friendly_name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Analyze the capture. Errors propagate to the queue's retry logic.
    fn process(&self, ctx: &mut ProcessingContext) -> anyhow::Result<ProcessorResult>;
}

/// Processor metadata for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorInfo {
    pub name: String,
    pub friendly_name: String,
    pub description: String,
    pub enabled: bool,
}

/// Ordered processor chain.
pub struct ProcessorRegistry {
    processors: Vec<Box<dyn ImageProcessor>>,
}

impl ProcessorRegistry {
    /// The built-in chain. Plate solving, source extraction, photometry and
    /// TLE matching plug in as additional [`ImageProcessor`]s from their
    /// own crates.
    pub fn standard() -> Self {
        Self::with_processors(vec![Box::new(quality::QualityCheckProcessor)])
    }

    pub fn with_processors(processors: Vec<Box<dyn ImageProcessor>>) -> Self {
        let names: Vec<&str> = processors.iter().map(|p| p.name()).collect();
        tracing::info!(count = processors.len(), ?names, "processor registry initialized");
        Self { processors }
    }

    /// Metadata for all processors, with enablement from settings
    /// (processors missing from the map default to enabled).
    pub fn processor_info(&self, settings: &Settings) -> Vec<ProcessorInfo> {
        self.processors
            .iter()
            .map(|p| ProcessorInfo {
                name: p.name().to_string(),
                friendly_name: p.friendly_name().to_string(),
                description: p.description().to_string(),
                enabled: settings.enabled_processors.get(p.name()).copied().unwrap_or(true),
            })
            .collect()
    }

    /// Run every enabled processor in order and aggregate.
    ///
    /// The capture bytes load once for the whole chain. Processor errors
    /// propagate.
    pub fn process_all(&self, ctx: &mut ProcessingContext) -> anyhow::Result<AggregatedResult> {
        let started = Instant::now();

        if ctx.image_data.is_none() {
            ctx.image_data = Some(std::fs::read(&ctx.image_path)?);
        }

        let enabled: Vec<&dyn ImageProcessor> = self
            .processors
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| ctx.settings.enabled_processors.get(p.name()).copied().unwrap_or(true))
            .collect();
        let skipped: Vec<&str> = self
            .processors
            .iter()
            .map(|p| p.name())
            .filter(|name| !ctx.settings.enabled_processors.get(*name).copied().unwrap_or(true))
            .collect();
        if !skipped.is_empty() {
            tracing::info!(?skipped, "skipping disabled processors");
        }

        let mut results = Vec::with_capacity(enabled.len());
        for processor in enabled {
            if let Some(task) = &ctx.task {
                task.set_status_msg(format!("Running {}...", processor.friendly_name()));
            }
            tracing::info!(processor = processor.name(), "starting processor");
            let proc_started = Instant::now();

            let result = processor.process(ctx)?;

            let elapsed = proc_started.elapsed().as_secs_f64();
            if result.confidence == 0.0 || !result.should_upload {
                tracing::warn!(
                    processor = processor.name(),
                    elapsed_s = elapsed,
                    confidence = result.confidence,
                    should_upload = result.should_upload,
                    reason = result.reason,
                    "processor rejected capture"
                );
            } else {
                tracing::info!(
                    processor = processor.name(),
                    elapsed_s = elapsed,
                    confidence = result.confidence,
                    keys = result.extracted.len(),
                    "processor completed"
                );
            }
            results.push(result);
        }

        let aggregated = aggregate(results, started.elapsed().as_secs_f64());
        tracing::info!(
            total_s = aggregated.total_time_s,
            keys = aggregated.extracted.len(),
            should_upload = aggregated.should_upload,
            "processor chain complete"
        );
        Ok(aggregated)
    }
}

fn aggregate(results: Vec<ProcessorResult>, total_time_s: f64) -> AggregatedResult {
    let should_upload = results.iter().all(|r| r.should_upload);

    let mut extracted = HashMap::new();
    for result in &results {
        for (key, value) in &result.extracted {
            extracted.insert(format!("{}.{key}", result.processor_name), value.clone());
        }
    }

    let skip_reason = results
        .iter()
        .find(|r| !r.should_upload)
        .map(|r| format!("{}: {}", r.processor_name, r.reason));

    AggregatedResult { should_upload, extracted, results, total_time_s, skip_reason }
}

#[cfg(test)]
pub(crate) fn test_context(image_path: PathBuf, working_dir: PathBuf) -> ProcessingContext {
    ProcessingContext {
        working_image_path: image_path.clone(),
        image_path,
        working_dir,
        image_data: None,
        task: None,
        telescope: None,
        ground_station: None,
        settings: Settings::default(),
        location: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProcessor {
        name: &'static str,
        should_upload: bool,
        reason: &'static str,
        fail: bool,
    }

    impl ImageProcessor for StubProcessor {
        fn name(&self) -> &'static str {
            self.name
        }
        fn friendly_name(&self) -> &'static str {
            "Stub"
        }
        fn description(&self) -> &'static str {
            "stub"
        }
        fn process(&self, _ctx: &mut ProcessingContext) -> anyhow::Result<ProcessorResult> {
            if self.fail {
                anyhow::bail!("stub blew up");
            }
            let mut extracted = HashMap::new();
            extracted.insert("value".to_string(), serde_json::json!(42));
            Ok(ProcessorResult {
                should_upload: self.should_upload,
                extracted,
                confidence: 0.8,
                reason: self.reason.to_string(),
                duration_s: 0.0,
                processor_name: self.name.to_string(),
            })
        }
    }

    fn fits_context(dir: &std::path::Path) -> ProcessingContext {
        let image = dir.join("cap.fits");
        crate::fits::write_minimal_fits(&image, 4, 4).unwrap();
        test_context(image, dir.join("work"))
    }

    #[test]
    fn aggregation_namespaces_keys_and_ands_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![
            Box::new(StubProcessor { name: "first", should_upload: true, reason: "ok", fail: false }),
            Box::new(StubProcessor { name: "second", should_upload: true, reason: "ok", fail: false }),
        ]);

        let mut ctx = fits_context(dir.path());
        let agg = registry.process_all(&mut ctx).unwrap();
        assert!(agg.should_upload);
        assert_eq!(agg.skip_reason, None);
        assert_eq!(agg.extracted["first.value"], serde_json::json!(42));
        assert_eq!(agg.extracted["second.value"], serde_json::json!(42));
        assert_eq!(agg.results.len(), 2);
    }

    #[test]
    fn first_veto_becomes_skip_reason() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![
            Box::new(StubProcessor { name: "a", should_upload: true, reason: "fine", fail: false }),
            Box::new(StubProcessor { name: "b", should_upload: false, reason: "cloudy", fail: false }),
            Box::new(StubProcessor { name: "c", should_upload: false, reason: "later", fail: false }),
        ]);

        let mut ctx = fits_context(dir.path());
        let agg = registry.process_all(&mut ctx).unwrap();
        assert!(!agg.should_upload);
        assert_eq!(agg.skip_reason.as_deref(), Some("b: cloudy"));
    }

    #[test]
    fn processor_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![Box::new(StubProcessor {
            name: "bomb",
            should_upload: true,
            reason: "",
            fail: true,
        })]);
        let mut ctx = fits_context(dir.path());
        assert!(registry.process_all(&mut ctx).is_err());
    }

    #[test]
    fn disabled_processors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![
            Box::new(StubProcessor { name: "on", should_upload: true, reason: "", fail: false }),
            Box::new(StubProcessor { name: "off", should_upload: false, reason: "", fail: false }),
        ]);

        let mut ctx = fits_context(dir.path());
        ctx.settings.enabled_processors.insert("off".to_string(), false);
        let agg = registry.process_all(&mut ctx).unwrap();
        assert!(agg.should_upload, "disabled veto must not apply");
        assert_eq!(agg.results.len(), 1);

        let info = registry.processor_info(&ctx.settings);
        assert!(info.iter().find(|i| i.name == "off").is_some_and(|i| !i.enabled));
    }

    #[test]
    fn empty_chain_allows_upload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![]);
        let mut ctx = fits_context(dir.path());
        let agg = registry.process_all(&mut ctx).unwrap();
        assert!(agg.should_upload);
        assert!(agg.extracted.is_empty());
    }

    #[test]
    fn image_loads_once_for_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessorRegistry::with_processors(vec![Box::new(StubProcessor {
            name: "a",
            should_upload: true,
            reason: "",
            fail: false,
        })]);
        let mut ctx = fits_context(dir.path());
        assert!(ctx.image_data.is_none());
        registry.process_all(&mut ctx).unwrap();
        assert!(ctx.image_data.is_some());
    }
}
