//! Stage-completion plumbing.
//!
//! Each queue stage reports its outcome as a typed [`StageEvent`] on one
//! channel; the daemon's event loop chains the stages together
//! (imaging → processing → upload) and owns the cross-stage decisions:
//! skip-vs-upload, plate-solve feedback into the mount model, and bucket
//! removal. The stage graph is fixed, so events beat a general-purpose
//! bus.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::{CitraApi, TerminalStatus};
use crate::hardware::HardwareAdapter;
use crate::location::LocationService;
use crate::processors::AggregatedResult;
use crate::queue::QueueHandle;
use crate::scheduler::Scheduler;
use crate::stages::upload::UploadItem;

/// Outcome of one stage for one task.
#[derive(Debug)]
pub enum StageEvent {
    ImagingFinished {
        task_id: String,
        success: bool,
    },
    ProcessingFinished {
        task_id: String,
        image_path: PathBuf,
        /// `None` after a permanent processing failure: fail-open, the raw
        /// capture still ships.
        result: Option<AggregatedResult>,
    },
    UploadFinished {
        task_id: String,
        success: bool,
    },
}

pub type StageEventTx = mpsc::UnboundedSender<StageEvent>;
pub type StageEventRx = mpsc::UnboundedReceiver<StageEvent>;

pub fn stage_event_channel() -> (StageEventTx, StageEventRx) {
    mpsc::unbounded_channel()
}

/// What the event loop needs to chain stages.
pub struct PipelineDeps {
    pub scheduler: Arc<Scheduler>,
    pub api: Arc<dyn CitraApi>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub location: Arc<LocationService>,
    pub upload: QueueHandle<UploadItem>,
}

/// Apply one stage event to the pipeline state.
pub async fn handle_stage_event(deps: &PipelineDeps, event: StageEvent) {
    match event {
        StageEvent::ImagingFinished { task_id, success } => {
            tracing::debug!(task_id, success, "imaging finished");
            if deps.scheduler.current_task_id().as_deref() == Some(task_id.as_str()) {
                deps.scheduler.clear_current();
            }
        }

        StageEvent::ProcessingFinished { task_id, image_path, result } => {
            let Some(task) = deps.scheduler.task_in_stages(&task_id) else {
                tracing::warn!(task_id, "processing finished for unknown task");
                return;
            };

            // Processor veto: the capture never ships, the task is done.
            if let Some(result) = &result {
                if !result.should_upload {
                    tracing::info!(
                        task_id,
                        reason = result.skip_reason.as_deref().unwrap_or("unspecified"),
                        "skipping upload per processor"
                    );
                    task.set_status_msg("Upload skipped by processors");
                    if let Err(err) =
                        deps.api.set_task_status(&task_id, TerminalStatus::Succeeded).await
                    {
                        tracing::error!(task_id, "failed to mark skipped task complete: {err:#}");
                    }
                    deps.scheduler.remove_from_stages(&task_id);
                    return;
                }

                // Let the mount model learn its pointing error.
                let solved_ra = result.extracted.get("plate_solver.ra_center").and_then(|v| v.as_f64());
                let solved_dec =
                    result.extracted.get("plate_solver.dec_center").and_then(|v| v.as_f64());
                if let (Some(ra), Some(dec)) = (solved_ra, solved_dec) {
                    deps.adapter.update_from_plate_solve(ra, dec, task.last_target());
                }
            }

            task.set_status_msg("Queued for upload...");
            deps.scheduler.update_stage(&task_id, citrascope_core::task::TaskStage::Uploading);
            let sensor_location = deps.location.current_location();
            deps.upload.submit(
                task_id.clone(),
                UploadItem { task, image_path, result, sensor_location },
            );
        }

        StageEvent::UploadFinished { task_id, success } => {
            if success {
                tracing::info!(task_id, "task fully complete (uploaded)");
            } else {
                tracing::error!(task_id, "upload permanently failed, giving up");
            }
            deps.scheduler.remove_from_stages(&task_id);
        }
    }
}
