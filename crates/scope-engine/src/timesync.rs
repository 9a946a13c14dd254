//! System clock health monitoring.
//!
//! A [`TimeSource`] reports the current clock offset; the [`TimeMonitor`]
//! polls it on a minutes-scale cadence and caches a [`TimeHealth`] that the
//! safety layer reads. Accurate time matters here: a satellite moves
//! arc-minutes per second, so a drifting clock points the telescope at
//! empty sky.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// Time synchronization status level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeStatus {
    Ok,
    /// Offset at or beyond the pause threshold: observations must stop.
    Critical,
    /// The offset could not be measured.
    Unknown,
}

/// Cached clock health.
#[derive(Debug, Clone, Serialize)]
pub struct TimeHealth {
    /// Clock offset in milliseconds (positive = system clock ahead), when
    /// known.
    pub offset_ms: Option<f64>,
    pub status: TimeStatus,
    /// Source the offset came from (`chrony`, `ntp`, ...).
    pub source: String,
    /// Epoch seconds of the measurement.
    pub checked_at: i64,
    pub message: Option<String>,
}

impl TimeHealth {
    /// Threshold is inclusive on the failing side: an offset exactly at the
    /// pause threshold is critical.
    pub fn from_offset(
        offset_ms: Option<f64>,
        source: &str,
        pause_threshold_ms: f64,
        message: Option<String>,
    ) -> Self {
        let status = match offset_ms {
            None => TimeStatus::Unknown,
            Some(offset) if offset.abs() < pause_threshold_ms => TimeStatus::Ok,
            Some(_) => TimeStatus::Critical,
        };
        Self {
            offset_ms,
            status,
            source: source.to_string(),
            checked_at: chrono::Utc::now().timestamp(),
            message,
        }
    }
}

/// A way of measuring the system clock offset.
///
/// Implementations may block (subprocess, UDP exchange); the monitor calls
/// them from a blocking thread.
pub trait TimeSource: Send + Sync {
    /// Clock offset in milliseconds (positive = system ahead), or `None`
    /// when the source is unreachable.
    fn offset_ms(&self) -> Option<f64>;
    fn source_name(&self) -> &'static str;
}

/// Reads the offset from a local chrony daemon via `chronyc tracking`.
pub struct ChronyTimeSource;

impl ChronyTimeSource {
    /// True when `chronyc tracking` runs successfully on this host.
    pub fn is_available() -> bool {
        std::process::Command::new("chronyc")
            .arg("tracking")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn parse_tracking(output: &str) -> Option<f64> {
        // "System time     : 0.000019947 seconds slow of NTP time"
        let line = output.lines().find(|l| l.trim_start().starts_with("System time"))?;
        let rest = line.split(':').nth(1)?.trim();
        let mut parts = rest.split_whitespace();
        let seconds: f64 = parts.next()?.parse().ok()?;
        let _ = parts.next()?; // "seconds"
        let direction = parts.next()?;
        let sign = match direction {
            "fast" => 1.0,
            "slow" => -1.0,
            _ => return None,
        };
        Some(sign * seconds * 1000.0)
    }
}

impl TimeSource for ChronyTimeSource {
    fn offset_ms(&self) -> Option<f64> {
        let out = std::process::Command::new("chronyc").arg("tracking").output().ok()?;
        if !out.status.success() {
            return None;
        }
        Self::parse_tracking(&String::from_utf8_lossy(&out.stdout))
    }

    fn source_name(&self) -> &'static str {
        "chrony"
    }
}

/// Used when no time daemon is reachable: every check reports Unknown,
/// which the safety layer treats as safe (losing the reference is not the
/// same as confirmed drift).
pub struct NoTimeSource;

impl TimeSource for NoTimeSource {
    fn offset_ms(&self) -> Option<f64> {
        None
    }

    fn source_name(&self) -> &'static str {
        "none"
    }
}

/// Background clock monitor caching the latest [`TimeHealth`].
pub struct TimeMonitor {
    source: Box<dyn TimeSource>,
    pause_threshold_ms: f64,
    check_interval: Duration,
    health: Mutex<Option<TimeHealth>>,
}

impl TimeMonitor {
    pub fn new(
        source: Box<dyn TimeSource>,
        pause_threshold_ms: f64,
        check_interval: Duration,
    ) -> Self {
        Self { source, pause_threshold_ms, check_interval, health: Mutex::new(None) }
    }

    /// Latest cached health, if a check has run.
    pub fn current_health(&self) -> Option<TimeHealth> {
        self.health.lock().expect("time health lock").clone()
    }

    /// Perform one synchronous check and update the cache.
    pub fn check_once(&self) {
        let offset = self.source.offset_ms();
        let health = TimeHealth::from_offset(
            offset,
            self.source.source_name(),
            self.pause_threshold_ms,
            None,
        );
        match health.status {
            TimeStatus::Ok => {
                tracing::debug!(offset_ms = ?health.offset_ms, "time sync ok");
            }
            TimeStatus::Critical => {
                tracing::error!(
                    offset_ms = ?health.offset_ms,
                    threshold_ms = self.pause_threshold_ms,
                    "critical clock drift, task processing will pause"
                );
            }
            TimeStatus::Unknown => {
                tracing::warn!("time sync check failed, offset unknown");
            }
        }
        *self.health.lock().expect("time health lock") = Some(health);
    }

    /// Spawn the periodic checking task. The first check runs immediately.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                let m = monitor.clone();
                if tokio::task::spawn_blocking(move || m.check_once()).await.is_err() {
                    tracing::error!("time check task panicked");
                }
                tokio::time::sleep(monitor.check_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_thresholds() {
        let ok = TimeHealth::from_offset(Some(499.9), "test", 500.0, None);
        assert_eq!(ok.status, TimeStatus::Ok);

        // Exactly at the pause threshold is critical (inclusive).
        let edge = TimeHealth::from_offset(Some(500.0), "test", 500.0, None);
        assert_eq!(edge.status, TimeStatus::Critical);

        let neg = TimeHealth::from_offset(Some(-900.0), "test", 500.0, None);
        assert_eq!(neg.status, TimeStatus::Critical);

        let unknown = TimeHealth::from_offset(None, "test", 500.0, None);
        assert_eq!(unknown.status, TimeStatus::Unknown);
    }

    #[test]
    fn parse_chronyc_tracking() {
        let out = "Reference ID    : C0A80001 (gateway)\n\
                   Stratum         : 3\n\
                   System time     : 0.000019947 seconds slow of NTP time\n\
                   Last offset     : -0.000005432 seconds\n";
        let offset = ChronyTimeSource::parse_tracking(out).unwrap();
        assert!((offset - -0.019947).abs() < 1e-9);

        let fast = "System time     : 0.25 seconds fast of NTP time\n";
        assert!((ChronyTimeSource::parse_tracking(fast).unwrap() - 250.0).abs() < 1e-9);

        assert!(ChronyTimeSource::parse_tracking("garbage").is_none());
    }

    struct FixedSource(Option<f64>);
    impl TimeSource for FixedSource {
        fn offset_ms(&self) -> Option<f64> {
            self.0
        }
        fn source_name(&self) -> &'static str {
            "fixed"
        }
    }

    #[test]
    fn monitor_caches_health() {
        let monitor =
            TimeMonitor::new(Box::new(FixedSource(Some(10.0))), 500.0, Duration::from_secs(300));
        assert!(monitor.current_health().is_none());
        monitor.check_once();
        let health = monitor.current_health().unwrap();
        assert_eq!(health.status, TimeStatus::Ok);
        assert_eq!(health.source, "fixed");
    }
}
