//! Processing stage: runs the processor chain over one capture.
//!
//! Stateless processors make the chain safely re-entrant, so worker count
//! is configurable. Each job gets an exclusively-owned working directory
//! under `<images-root>/../processing/<task-id>/`, deleted whatever the
//! outcome. Permanent failure is fail-open: the raw capture still ships.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use citrascope_core::settings::SettingsStore;
use citrascope_core::task::Task;

use crate::api::{GroundStationDto, TelescopeDto};
use crate::location::LocationService;
use crate::pipeline::{StageEvent, StageEventTx};
use crate::processors::{ProcessingContext, ProcessorRegistry};
use crate::queue::StageWorker;

/// One capture awaiting the processor chain.
pub struct ProcessingItem {
    pub task: Arc<Task>,
    pub image_path: PathBuf,
}

pub struct ProcessingStage {
    pub registry: Arc<ProcessorRegistry>,
    pub settings: Arc<SettingsStore>,
    pub telescope: TelescopeDto,
    pub ground_station: GroundStationDto,
    pub location: Arc<LocationService>,
    pub events: StageEventTx,
}

impl ProcessingStage {
    fn working_dir(&self, task_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.settings.snapshot().processing_dir()?.join(task_id))
    }

    fn cleanup_working_dir(&self, task_id: &str) {
        let Ok(dir) = self.working_dir(task_id) else { return };
        if dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(task_id, dir = %dir.display(), "working dir cleanup failed: {err}");
            } else {
                tracing::debug!(task_id, dir = %dir.display(), "cleaned up working dir");
            }
        }
    }
}

#[async_trait]
impl StageWorker for ProcessingStage {
    type Item = ProcessingItem;
    type Output = crate::processors::AggregatedResult;

    fn stage_name(&self) -> &'static str {
        "Processing"
    }

    async fn execute(
        &self,
        item: &ProcessingItem,
    ) -> anyhow::Result<(bool, Option<Self::Output>)> {
        let task = &item.task;
        tracing::info!(task_id = task.id, image = %item.image_path.display(), "processing capture");

        let working_dir = self.working_dir(&task.id)?;
        std::fs::create_dir_all(&working_dir)?;

        let mut ctx = ProcessingContext {
            image_path: item.image_path.clone(),
            working_image_path: item.image_path.clone(),
            working_dir,
            image_data: None,
            task: Some(task.clone()),
            telescope: Some(self.telescope.clone()),
            ground_station: Some(self.ground_station.clone()),
            settings: self.settings.snapshot(),
            location: Some(self.location.current_location()),
        };

        let registry = self.registry.clone();
        // Processor errors propagate so the generic retry logic engages.
        let result =
            tokio::task::spawn_blocking(move || registry.process_all(&mut ctx)).await??;

        tracing::info!(task_id = task.id, total_s = result.total_time_s, "capture processed");
        Ok((true, Some(result)))
    }

    async fn on_success(&self, item: ProcessingItem, output: Option<Self::Output>) {
        item.task.set_status_msg("Processing complete");
        self.cleanup_working_dir(&item.task.id);
        let _ = self.events.send(StageEvent::ProcessingFinished {
            task_id: item.task.id.clone(),
            image_path: item.image_path,
            result: output,
        });
    }

    async fn on_permanent_failure(&self, item: ProcessingItem) {
        tracing::error!(
            task_id = item.task.id,
            "processing permanently failed, uploading raw image"
        );
        item.task.set_status_msg("Processing permanently failed (uploading raw image)");
        self.cleanup_working_dir(&item.task.id);
        // Fail-open: a nil result means "ship the raw capture".
        let _ = self.events.send(StageEvent::ProcessingFinished {
            task_id: item.task.id.clone(),
            image_path: item.image_path,
            result: None,
        });
    }

    fn task_of(&self, item: &ProcessingItem) -> Option<Arc<Task>> {
        Some(item.task.clone())
    }
}
