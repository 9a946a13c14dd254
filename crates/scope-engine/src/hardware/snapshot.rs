//! Cached mount state: one polling task, non-blocking reads for everyone
//! else.
//!
//! Periodic device reads are consolidated into a single ~2 Hz task that
//! publishes an immutable [`MountSnapshot`] on a watch channel. Status
//! readers (web UI, safety checks) borrow the latest snapshot and never
//! touch serial I/O; operational commands (slew, sync, abort, home) still
//! go straight to the adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::hardware::{HardwareAdapter, MountMode};

/// Point-in-time capture of commonly-read mount state.
#[derive(Debug, Clone)]
pub struct MountSnapshot {
    /// Seconds since the cache started, at poll time.
    pub age_marker: f64,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub az_deg: Option<f64>,
    pub alt_deg: Option<f64>,
    pub is_tracking: bool,
    pub is_slewing: bool,
    pub is_parked: bool,
    pub is_at_home: bool,
    pub mode: MountMode,
}

impl Default for MountSnapshot {
    fn default() -> Self {
        Self {
            age_marker: 0.0,
            ra_deg: None,
            dec_deg: None,
            az_deg: None,
            alt_deg: None,
            is_tracking: false,
            is_slewing: false,
            is_parked: false,
            is_at_home: false,
            mode: MountMode::Unknown,
        }
    }
}

fn poll_once(adapter: &dyn HardwareAdapter, age_marker: f64) -> MountSnapshot {
    let (ra_deg, dec_deg) = match adapter.cached_direction() {
        Some((ra, dec)) => (Some(ra), Some(dec)),
        None => (None, None),
    };
    MountSnapshot {
        age_marker,
        ra_deg,
        dec_deg,
        az_deg: adapter.azimuth(),
        alt_deg: adapter.altitude(),
        is_tracking: adapter.is_tracking(),
        is_slewing: adapter.telescope_is_moving().unwrap_or(false),
        is_parked: adapter.is_parked(),
        is_at_home: adapter.is_mount_homed(),
        mode: adapter.mount_mode(),
    }
}

/// Owns the polling task and the published snapshot.
pub struct MountStatusCache {
    rx: watch::Receiver<MountSnapshot>,
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl MountStatusCache {
    /// Start polling `adapter` every `interval` (2 Hz in production).
    pub fn start(adapter: Arc<dyn HardwareAdapter>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(MountSnapshot::default());
        let stop = Arc::new(AtomicBool::new(false));
        let stop_task = stop.clone();

        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if stop_task.load(Ordering::SeqCst) {
                    break;
                }
                let adapter = adapter.clone();
                let age = started.elapsed().as_secs_f64();
                match tokio::task::spawn_blocking(move || poll_once(adapter.as_ref(), age)).await {
                    Ok(snap) => {
                        let _ = tx.send(snap);
                    }
                    Err(err) => {
                        tracing::error!("mount state poll panicked: {err:#}");
                    }
                }
            }
        });

        Self { rx, stop, handle }
    }

    /// Latest snapshot; a cheap clone, no device I/O.
    pub fn snapshot(&self) -> MountSnapshot {
        self.rx.borrow().clone()
    }

    /// A receiver for consumers that want change notifications.
    pub fn subscribe(&self) -> watch::Receiver<MountSnapshot> {
        self.rx.clone()
    }

    pub async fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimAdapter;

    #[tokio::test]
    async fn cache_publishes_adapter_state() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(SimAdapter::new(dir.path().to_path_buf()));
        adapter.set_azimuth(123.0);

        let cache = MountStatusCache::start(adapter.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let snap = cache.snapshot();
        assert_eq!(snap.mode, MountMode::AltAz);
        assert_eq!(snap.az_deg, Some(123.0));
        assert!(!snap.is_slewing);

        cache.stop().await;
    }
}
