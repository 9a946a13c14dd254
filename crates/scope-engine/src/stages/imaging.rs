//! Imaging stage: drives the mount and camera for one task.
//!
//! Worker count is fixed at 1, since there is only one mount. A successful
//! attempt hands the captures to the processing queue (or straight to
//! upload when processors are disabled) and returns immediately so the
//! telescope can start the next job.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use citrascope_core::settings::SettingsStore;
use citrascope_core::task::{Task, TaskStage};

use crate::api::{CitraApi, TerminalStatus};
use crate::ephemeris::EphemerisProvider;
use crate::hardware::HardwareAdapter;
use crate::location::LocationService;
use crate::pipeline::{StageEvent, StageEventTx};
use crate::queue::{QueueHandle, StageWorker};
use crate::scheduler::Scheduler;
use crate::stages::processing::ProcessingItem;
use crate::stages::upload::UploadItem;
use crate::track::{TrackingJob, select_elset};

/// One queued observation.
pub struct ImagingItem {
    pub task: Arc<Task>,
}

pub struct ImagingStage {
    pub api: Arc<dyn CitraApi>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub ephemeris: Arc<dyn EphemerisProvider>,
    pub location: Arc<LocationService>,
    pub settings: Arc<SettingsStore>,
    pub scheduler: Arc<Scheduler>,
    pub processing: QueueHandle<ProcessingItem>,
    pub upload: QueueHandle<UploadItem>,
    pub events: StageEventTx,
    /// Shared cancellation flag, latched by the operator stop.
    pub cancel: Arc<AtomicBool>,
}

#[async_trait]
impl StageWorker for ImagingStage {
    type Item = ImagingItem;
    type Output = ();

    fn stage_name(&self) -> &'static str {
        "Imaging"
    }

    async fn execute(&self, item: &ImagingItem) -> anyhow::Result<(bool, Option<()>)> {
        let task = &item.task;
        tracing::info!(task_id = task.id, satellite = task.satellite_name, "imaging task");

        // Re-assert the stage for retries and clear stale messages.
        self.scheduler.update_stage(&task.id, TaskStage::Imaging);
        task.set_status_msg("Starting imaging...");

        let satellite = self.api.satellite(&task.satellite_id).await?;
        let elset = select_elset(&satellite)?;
        let site = self.location.current_location();
        let ephemeris = self.ephemeris.for_elset(&elset, &site)?;

        let settings = self.settings.snapshot();
        let job = TrackingJob::new(
            task.clone(),
            self.adapter.clone(),
            ephemeris,
            satellite,
            settings.exposure_s,
            self.cancel.clone(),
        );
        let paths = tokio::task::spawn_blocking(move || job.run()).await??;

        if settings.processors_enabled {
            task.set_status_msg("Queued for processing...");
            self.scheduler.update_stage(&task.id, TaskStage::Processing);
            for path in paths {
                self.processing
                    .submit(task.id.clone(), ProcessingItem { task: task.clone(), image_path: path });
            }
        } else {
            task.set_status_msg("Queued for upload...");
            self.scheduler.update_stage(&task.id, TaskStage::Uploading);
            let sensor_location = self.location.current_location();
            for path in paths {
                self.upload.submit(
                    task.id.clone(),
                    UploadItem {
                        task: task.clone(),
                        image_path: path,
                        result: None,
                        sensor_location: sensor_location.clone(),
                    },
                );
            }
        }

        Ok((true, None))
    }

    async fn on_success(&self, item: ImagingItem, _output: Option<()>) {
        // Status was already advanced by the hand-off; just free the mount.
        tracing::info!(task_id = item.task.id, "imaging completed");
        let _ = self
            .events
            .send(StageEvent::ImagingFinished { task_id: item.task.id.clone(), success: true });
    }

    async fn on_permanent_failure(&self, item: ImagingItem) {
        let task = &item.task;
        tracing::error!(task_id = task.id, "imaging permanently failed");
        task.set_status_msg("Imaging permanently failed");
        if let Err(err) = self.api.set_task_status(&task.id, TerminalStatus::Failed).await {
            tracing::error!(task_id = task.id, "failed to mark task failed: {err:#}");
        }
        self.scheduler.remove_from_stages(&task.id);
        let _ = self
            .events
            .send(StageEvent::ImagingFinished { task_id: task.id.clone(), success: false });
    }

    fn task_of(&self, item: &ImagingItem) -> Option<Arc<Task>> {
        Some(item.task.clone())
    }
}
