//! Disk space safety check: prevents imaging when storage is critically
//! low.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::safety::{ActionKind, SafetyAction, SafetyCheck};

/// Below this free-byte count the check reports WARN.
pub const WARN_BYTES: u64 = 1_000_000_000; // 1 GB
/// Below this free-byte count the check reports QUEUE_STOP and blocks
/// captures.
pub const CRITICAL_BYTES: u64 = 200_000_000; // 200 MB

/// Probe returning free bytes for a path, injectable for tests.
pub(crate) type FreeBytesProbe = Box<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

/// Monitors free disk space on the images volume.
pub struct DiskSpaceCheck {
    images_dir: PathBuf,
    probe: FreeBytesProbe,
    free_bytes: Mutex<Option<u64>>,
}

impl DiskSpaceCheck {
    pub fn new(images_dir: PathBuf) -> Self {
        Self::with_probe(images_dir, Box::new(free_bytes_for))
    }

    pub(crate) fn with_probe(images_dir: PathBuf, probe: FreeBytesProbe) -> Self {
        Self { images_dir, probe, free_bytes: Mutex::new(None) }
    }

    fn free(&self) -> Option<u64> {
        *self.free_bytes.lock().expect("disk space lock")
    }
}

/// Available bytes on the filesystem holding `path`, via the mounted-disk
/// list (longest matching mount point wins).
fn free_bytes_for(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

impl SafetyCheck for DiskSpaceCheck {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    fn check(&self) -> anyhow::Result<SafetyAction> {
        let free = (self.probe)(&self.images_dir);
        *self.free_bytes.lock().expect("disk space lock") = free;

        let Some(free) = free else {
            tracing::debug!(dir = %self.images_dir.display(), "could not read disk usage");
            return Ok(SafetyAction::Safe);
        };

        if free < CRITICAL_BYTES {
            tracing::error!(
                free_mb = free / 1_000_000,
                critical_mb = CRITICAL_BYTES / 1_000_000,
                "disk space critical"
            );
            return Ok(SafetyAction::QueueStop);
        }
        if free < WARN_BYTES {
            tracing::warn!(free_mb = free / 1_000_000, "disk space low");
            return Ok(SafetyAction::Warn);
        }
        Ok(SafetyAction::Safe)
    }

    fn check_proposed_action(&self, kind: ActionKind) -> anyhow::Result<bool> {
        if kind == ActionKind::Capture {
            if let Some(free) = self.free() {
                return Ok(free >= CRITICAL_BYTES);
            }
        }
        Ok(true)
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "free_mb": self.free().map(|b| b / 1_000_000),
            "warn_mb": WARN_BYTES / 1_000_000,
            "critical_mb": CRITICAL_BYTES / 1_000_000,
        })
    }
}
