//! Scheduled observation task: immutable identity from the server plus
//! process-local execution state that is never sent back.

use std::sync::Mutex;

use anyhow::Context as _;

/// Pipeline stage a task currently occupies once it has left the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    /// Mount/camera worker owns the task.
    Imaging,
    /// Processor chain is running on the capture.
    Processing,
    /// Capture and observations are being pushed to the server.
    Uploading,
}

#[derive(Debug, Default)]
struct ExecState {
    status_msg: Option<String>,
    /// Wall-clock epoch seconds of the next retry attempt, when one is
    /// scheduled.
    retry_at: Option<f64>,
    /// True while a queue worker is actively executing this task.
    executing: bool,
    /// Last commanded pointing (RA/Dec degrees), used as the expected
    /// position when a plate solve reports where the mount really was.
    last_target: Option<(f64, f64)>,
}

/// One scheduled unit of work from the dispatch server.
///
/// Identity fields are immutable; execution state is guarded by a per-task
/// lock so status readers (web UI, logs) and queue workers never race.
#[derive(Debug)]
pub struct Task {
    pub id: String,
    pub satellite_id: String,
    pub satellite_name: String,
    pub telescope_id: String,
    pub telescope_name: String,
    pub ground_station_id: String,
    pub ground_station_name: String,
    /// Observation window start, epoch seconds.
    pub start_epoch: i64,
    /// Observation window end, epoch seconds.
    pub stop_epoch: i64,
    pub assigned_filter_name: Option<String>,

    exec: Mutex<ExecState>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        satellite_id: String,
        satellite_name: String,
        telescope_id: String,
        telescope_name: String,
        ground_station_id: String,
        ground_station_name: String,
        start_epoch: i64,
        stop_epoch: i64,
        assigned_filter_name: Option<String>,
    ) -> Self {
        Self {
            id,
            satellite_id,
            satellite_name,
            telescope_id,
            telescope_name,
            ground_station_id,
            ground_station_name,
            start_epoch,
            stop_epoch,
            assigned_filter_name,
            exec: Mutex::new(ExecState::default()),
        }
    }

    pub fn set_status_msg(&self, msg: impl Into<String>) {
        self.exec.lock().expect("task lock").status_msg = Some(msg.into());
    }

    pub fn status_msg(&self) -> Option<String> {
        self.exec.lock().expect("task lock").status_msg.clone()
    }

    pub fn set_retry_at(&self, epoch: Option<f64>) {
        self.exec.lock().expect("task lock").retry_at = epoch;
    }

    pub fn retry_at(&self) -> Option<f64> {
        self.exec.lock().expect("task lock").retry_at
    }

    pub fn set_executing(&self, executing: bool) {
        self.exec.lock().expect("task lock").executing = executing;
    }

    pub fn executing(&self) -> bool {
        self.exec.lock().expect("task lock").executing
    }

    pub fn set_last_target(&self, ra_deg: f64, dec_deg: f64) {
        self.exec.lock().expect("task lock").last_target = Some((ra_deg, dec_deg));
    }

    pub fn last_target(&self) -> Option<(f64, f64)> {
        self.exec.lock().expect("task lock").last_target
    }

    /// All status fields in one lock acquisition, for status reporters.
    pub fn status_info(&self) -> (Option<String>, Option<f64>, bool) {
        let exec = self.exec.lock().expect("task lock");
        (exec.status_msg.clone(), exec.retry_at, exec.executing)
    }
}

/// Parse a server-side ISO-8601 timestamp into epoch seconds.
pub fn parse_epoch(iso: &str) -> anyhow::Result<i64> {
    let dt = chrono::DateTime::parse_from_rfc3339(iso)
        .with_context(|| format!("invalid timestamp {iso:?}"))?;
    Ok(dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "task-001".into(),
            "sat-1".into(),
            "TESTSAT".into(),
            "tel-1".into(),
            "Test Telescope".into(),
            "gs-1".into(),
            "Test Station".into(),
            1_700_000_000,
            1_700_000_300,
            None,
        )
    }

    #[test]
    fn status_fields_roundtrip() {
        let t = task();
        assert_eq!(t.status_msg(), None);
        assert!(!t.executing());

        t.set_status_msg("Starting imaging...");
        t.set_executing(true);
        t.set_retry_at(Some(1_700_000_100.0));

        let (msg, retry, executing) = t.status_info();
        assert_eq!(msg.as_deref(), Some("Starting imaging..."));
        assert_eq!(retry, Some(1_700_000_100.0));
        assert!(executing);

        t.set_retry_at(None);
        assert_eq!(t.retry_at(), None);
    }

    #[test]
    fn parse_epoch_accepts_offsets() {
        assert_eq!(parse_epoch("1970-01-01T00:00:00Z").unwrap(), 0);
        assert_eq!(parse_epoch("1970-01-01T01:00:00+01:00").unwrap(), 0);
        assert!(parse_epoch("not-a-timestamp").is_err());
    }
}
