//! Upload stage: ships a capture and its derived observations.
//!
//! Order per attempt: honor a processor veto, enrich the capture's header
//! (idempotent), upload through the server-signed multipart target, post
//! derived optical observations when the chain extracted any, then mark
//! the task Succeeded. A failure anywhere fails the whole item so the
//! retry re-runs every step.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use citrascope_core::settings::SettingsStore;
use citrascope_core::task::Task;

use crate::api::{CitraApi, OpticalObservationDto, TelescopeDto, TerminalStatus};
use crate::fits::{EnrichmentContext, enrich_fits_metadata};
use crate::location::SensorLocation;
use crate::pipeline::{StageEvent, StageEventTx};
use crate::processors::AggregatedResult;
use crate::queue::StageWorker;

/// Extracted-data key carrying per-image satellite observations.
const OBSERVATIONS_KEY: &str = "satellite_matcher.observations";

/// One capture ready to ship.
pub struct UploadItem {
    pub task: Arc<Task>,
    pub image_path: PathBuf,
    /// `None` means processing failed permanently (or was disabled): the
    /// raw capture ships as-is.
    pub result: Option<AggregatedResult>,
    /// Captured at queue time so the worker never reaches back into the
    /// location service mid-upload.
    pub sensor_location: SensorLocation,
}

pub struct UploadStage {
    pub api: Arc<dyn CitraApi>,
    pub settings: Arc<SettingsStore>,
    pub telescope: TelescopeDto,
    pub events: StageEventTx,
}

impl UploadStage {
    fn enrichment_context(&self, item: &UploadItem) -> EnrichmentContext {
        let task = &item.task;
        EnrichmentContext {
            location: Some(item.sensor_location.clone()),
            object: Some(task.satellite_name.clone()),
            observer: Some(task.ground_station_name.clone()),
            telescope: Some(task.telescope_name.clone()).filter(|n| !n.is_empty()).or_else(|| {
                Some(self.telescope.name.clone())
            }),
            filter: task.assigned_filter_name.clone(),
            task_id: Some(task.id.clone()),
        }
    }

    /// Build the optical-observation batch from the aggregated result, if
    /// the chain extracted any.
    fn observations(&self, item: &UploadItem) -> Vec<OpticalObservationDto> {
        let Some(result) = &item.result else { return Vec::new() };
        let Some(serde_json::Value::Array(entries)) = result.extracted.get(OBSERVATIONS_KEY)
        else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| {
                let norad_id = entry.get("norad_id")?;
                let satellite_id = match norad_id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some(OpticalObservationDto {
                    satellite_id,
                    telescope_id: self.telescope.id.clone(),
                    epoch: entry.get("timestamp")?.as_str()?.to_string(),
                    right_ascension: entry.get("ra")?.as_f64()?,
                    declination: entry.get("dec")?.as_f64()?,
                    sensor_latitude: item.sensor_location.latitude,
                    sensor_longitude: item.sensor_location.longitude,
                    sensor_altitude: item.sensor_location.altitude,
                    angular_noise: self.telescope.angular_noise,
                    visual_magnitude: entry.get("mag").and_then(|v| v.as_f64()),
                    task_id: Some(item.task.id.clone()),
                    min_wavelength: self.telescope.spectral_min_wavelength_nm,
                    max_wavelength: self.telescope.spectral_max_wavelength_nm,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StageWorker for UploadStage {
    type Item = UploadItem;
    type Output = ();

    fn stage_name(&self) -> &'static str {
        "Upload"
    }

    async fn execute(&self, item: &UploadItem) -> anyhow::Result<(bool, Option<()>)> {
        let task = &item.task;

        // Processor veto: nothing ships, the task is simply done.
        if let Some(result) = &item.result {
            if !result.should_upload {
                tracing::info!(
                    task_id = task.id,
                    reason = result.skip_reason.as_deref().unwrap_or("unspecified"),
                    "upload skipped per processors"
                );
                self.api.set_task_status(&task.id, TerminalStatus::Succeeded).await?;
                return Ok((true, None));
            }
        }

        task.set_status_msg("Uploading...");

        // Enrichment is best-effort and idempotent; a capture that cannot
        // be annotated still ships.
        let ctx = self.enrichment_context(item);
        let path = item.image_path.clone();
        let enriched =
            tokio::task::spawn_blocking(move || enrich_fits_metadata(&path, &ctx)).await;
        match enriched {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(task_id = task.id, "metadata enrichment failed: {err:#}");
            }
            Err(err) => tracing::error!(task_id = task.id, "enrichment task panicked: {err:#}"),
        }

        self.api.upload_image(&task.id, &self.telescope.id, &item.image_path).await?;

        let observations = self.observations(item);
        if !observations.is_empty() {
            self.api.post_optical_observations(&observations).await?;
        }

        self.api.set_task_status(&task.id, TerminalStatus::Succeeded).await?;

        if !self.settings.snapshot().keep_images {
            if let Err(err) = std::fs::remove_file(&item.image_path) {
                tracing::warn!(
                    task_id = task.id,
                    image = %item.image_path.display(),
                    "could not delete uploaded capture: {err}"
                );
            }
        }

        Ok((true, None))
    }

    async fn on_success(&self, item: UploadItem, _output: Option<()>) {
        item.task.set_status_msg("Upload complete");
        let _ = self
            .events
            .send(StageEvent::UploadFinished { task_id: item.task.id.clone(), success: true });
    }

    async fn on_permanent_failure(&self, item: UploadItem) {
        tracing::error!(task_id = item.task.id, "upload permanently failed");
        item.task.set_status_msg("Upload permanently failed");
        let _ = self
            .events
            .send(StageEvent::UploadFinished { task_id: item.task.id.clone(), success: false });
    }

    fn task_of(&self, item: &UploadItem) -> Option<Arc<Task>> {
        Some(item.task.clone())
    }
}
