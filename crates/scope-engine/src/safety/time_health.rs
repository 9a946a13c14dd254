//! Bridges the clock monitor into the safety framework.

use std::sync::Arc;

use crate::safety::{SafetyAction, SafetyCheck};
use crate::timesync::{TimeMonitor, TimeStatus};

/// Maps the cached [`crate::timesync::TimeHealth`] to a severity. The
/// monitoring itself stays in [`TimeMonitor`].
pub struct TimeHealthCheck {
    monitor: Arc<TimeMonitor>,
}

impl TimeHealthCheck {
    pub fn new(monitor: Arc<TimeMonitor>) -> Self {
        Self { monitor }
    }
}

impl SafetyCheck for TimeHealthCheck {
    fn name(&self) -> &'static str {
        "time_health"
    }

    fn check(&self) -> anyhow::Result<SafetyAction> {
        match self.monitor.current_health() {
            Some(health) if health.status == TimeStatus::Critical => Ok(SafetyAction::QueueStop),
            _ => Ok(SafetyAction::Safe),
        }
    }

    fn status(&self) -> serde_json::Value {
        match self.monitor.current_health() {
            Some(health) => serde_json::json!({
                "offset_ms": health.offset_ms,
                "source": health.source,
                "time_status": health.status,
            }),
            None => serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::TimeSource;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CellSource(Mutex<Option<f64>>);
    impl TimeSource for CellSource {
        fn offset_ms(&self) -> Option<f64> {
            *self.0.lock().unwrap()
        }
        fn source_name(&self) -> &'static str {
            "cell"
        }
    }

    fn monitor_with_offset(offset: Option<f64>) -> Arc<TimeMonitor> {
        let monitor = Arc::new(TimeMonitor::new(
            Box::new(CellSource(Mutex::new(offset))),
            500.0,
            Duration::from_secs(300),
        ));
        monitor.check_once();
        monitor
    }

    #[test]
    fn no_health_yet_is_safe() {
        let monitor = Arc::new(TimeMonitor::new(
            Box::new(CellSource(Mutex::new(None))),
            500.0,
            Duration::from_secs(300),
        ));
        let chk = TimeHealthCheck::new(monitor);
        assert_eq!(chk.check().unwrap(), SafetyAction::Safe);
    }

    #[test]
    fn small_offset_is_safe() {
        let chk = TimeHealthCheck::new(monitor_with_offset(Some(42.0)));
        assert_eq!(chk.check().unwrap(), SafetyAction::Safe);
    }

    #[test]
    fn offset_at_threshold_stops_queue() {
        let chk = TimeHealthCheck::new(monitor_with_offset(Some(500.0)));
        assert_eq!(chk.check().unwrap(), SafetyAction::QueueStop);
    }

    #[test]
    fn unknown_offset_is_safe() {
        // Fail-open here: losing the NTP server should not halt the
        // pipeline, only a confirmed drift should.
        let chk = TimeHealthCheck::new(monitor_with_offset(None));
        assert_eq!(chk.check().unwrap(), SafetyAction::Safe);
    }
}
