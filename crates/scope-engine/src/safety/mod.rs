//! Pluggable safety checks with a watchdog task.
//!
//! Three layers of enforcement:
//!   1. **Watchdog task**: evaluates checks at ~1 Hz, fires the abort
//!      callback on EMERGENCY.
//!   2. **Pre-action gate**: [`SafetyMonitor::is_action_safe`] called
//!      before slews and captures.
//!   3. **Runner-loop integration**: [`SafetyMonitor::evaluate`] called
//!      between tasks for cooperative corrective work.

mod cable_wrap;
mod disk_space;
mod operator_stop;
mod time_health;

pub use cable_wrap::{CableWrapCheck, HARD_LIMIT_DEG, SOFT_LIMIT_DEG};
pub use disk_space::{CRITICAL_BYTES, DiskSpaceCheck, WARN_BYTES};
pub use operator_stop::OperatorStopCheck;
pub use time_health::TimeHealthCheck;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Severity level returned by a safety check, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    Safe,
    Warn,
    /// Stop dispatching new work; in-flight work may finish.
    QueueStop,
    /// Halt all motion now.
    Emergency,
}

/// The kind of operation a pre-action gate is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Slew,
    Capture,
}

/// A single safety predicate.
///
/// `check()` may have side effects (the cable-wrap check accumulates state
/// on every call), so status reporting reads the monitor's cached action
/// instead of re-invoking it. An `Err` from `check()` or the gate is
/// fail-closed: QUEUE_STOP / blocked respectively.
pub trait SafetyCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Assess current conditions.
    fn check(&self) -> anyhow::Result<SafetyAction>;

    /// Pre-flight gate: is this specific action safe to start?
    fn check_proposed_action(&self, _kind: ActionKind) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Whether [`SafetyCheck::execute_action`] does anything for this check.
    fn has_corrective_action(&self) -> bool {
        false
    }

    /// Perform corrective work (e.g. a cable unwind). Blocking; run it on a
    /// blocking thread.
    fn execute_action(&self) {}

    /// Clear state after a corrective action completes.
    fn reset(&self) {}

    /// Check-specific status fields for reporting.
    fn status(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name() })
    }
}

/// One entry of a [`SafetySnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckStatus {
    pub name: String,
    /// Most recent cached severity, not a fresh evaluation.
    pub action: SafetyAction,
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

/// Status of the whole safety subsystem for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SafetySnapshot {
    pub checks: Vec<CheckStatus>,
    pub watchdog_alive: bool,
    /// Seconds since monitor creation at the last watchdog heartbeat.
    pub watchdog_last_heartbeat_monotonic: f64,
}

/// Composes safety checks and runs the watchdog.
pub struct SafetyMonitor {
    checks: Vec<Arc<dyn SafetyCheck>>,
    abort_callback: Option<Box<dyn Fn() + Send + Sync>>,

    cached_actions: Mutex<HashMap<&'static str, SafetyAction>>,
    started: Instant,
    watchdog_interval: Duration,
    last_heartbeat: Mutex<Option<Duration>>,
    watchdog_stop: AtomicBool,
    watchdog_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SafetyMonitor {
    pub fn new(
        checks: Vec<Arc<dyn SafetyCheck>>,
        abort_callback: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            checks,
            abort_callback,
            cached_actions: Mutex::new(HashMap::new()),
            started: Instant::now(),
            watchdog_interval: Duration::from_secs(1),
            last_heartbeat: Mutex::new(None),
            watchdog_stop: AtomicBool::new(false),
            watchdog_handle: Mutex::new(None),
        }
    }

    /// Run all checks and return the worst severity with its trigger.
    ///
    /// Fail-closed: a check that errors is treated as QUEUE_STOP so new
    /// work is blocked until it recovers. We don't escalate to EMERGENCY
    /// because a code bug shouldn't fire abort on the mount.
    pub fn evaluate(&self) -> (SafetyAction, Option<Arc<dyn SafetyCheck>>) {
        let mut worst = SafetyAction::Safe;
        let mut worst_check: Option<Arc<dyn SafetyCheck>> = None;

        for chk in &self.checks {
            let action = match chk.check() {
                Ok(action) => action,
                Err(err) => {
                    tracing::error!(
                        check = chk.name(),
                        "safety check failed, treating as QUEUE_STOP: {err:#}"
                    );
                    SafetyAction::QueueStop
                }
            };
            self.cached_actions
                .lock()
                .expect("cached actions lock")
                .insert(chk.name(), action);
            if action > worst {
                worst = action;
                worst_check = Some(chk.clone());
            }
        }
        (worst, worst_check)
    }

    /// Pre-action gate: ask every check whether `kind` is safe to start.
    ///
    /// Fail-closed: a gate that errors blocks the action.
    pub fn is_action_safe(&self, kind: ActionKind) -> bool {
        for chk in &self.checks {
            match chk.check_proposed_action(kind) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(check = chk.name(), ?kind, "safety check blocked action");
                    return false;
                }
                Err(err) => {
                    tracing::error!(
                        check = chk.name(),
                        ?kind,
                        "pre-action gate failed, blocking: {err:#}"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Find a registered check by name.
    pub fn get_check(&self, name: &str) -> Option<Arc<dyn SafetyCheck>> {
        self.checks.iter().find(|chk| chk.name() == name).cloned()
    }

    /// Status of all checks from cached actions (no re-evaluation).
    pub fn status(&self) -> SafetySnapshot {
        let cached = self.cached_actions.lock().expect("cached actions lock");
        let checks = self
            .checks
            .iter()
            .map(|chk| CheckStatus {
                name: chk.name().to_string(),
                action: cached.get(chk.name()).copied().unwrap_or(SafetyAction::Safe),
                fields: chk.status(),
            })
            .collect();

        let last = self.last_heartbeat.lock().expect("heartbeat lock");
        SafetySnapshot {
            checks,
            watchdog_alive: self.watchdog_healthy(),
            watchdog_last_heartbeat_monotonic: last.map(|d| d.as_secs_f64()).unwrap_or(0.0),
        }
    }

    /// True if the watchdog has checked in within 3x its poll interval.
    pub fn watchdog_healthy(&self) -> bool {
        let last = self.last_heartbeat.lock().expect("heartbeat lock");
        match *last {
            None => false,
            Some(at) => self.started.elapsed() - at < self.watchdog_interval * 3,
        }
    }

    fn beat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Some(self.started.elapsed());
    }

    /// Start the ~1 Hz watchdog. On EMERGENCY the abort callback fires
    /// exactly once per transition into the state.
    pub fn start_watchdog(self: &Arc<Self>) {
        let mut handle = self.watchdog_handle.lock().expect("watchdog handle lock");
        if handle.is_some() {
            return;
        }
        self.watchdog_stop.store(false, Ordering::SeqCst);

        let monitor = self.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.watchdog_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut in_emergency = false;

            loop {
                ticker.tick().await;
                if monitor.watchdog_stop.load(Ordering::SeqCst) {
                    break;
                }
                monitor.beat();

                let monitor_eval = monitor.clone();
                let evaluated =
                    tokio::task::spawn_blocking(move || monitor_eval.evaluate()).await;
                let (action, triggered) = match evaluated {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::error!("watchdog evaluation join failed: {err:#}");
                        continue;
                    }
                };

                if action == SafetyAction::Emergency {
                    if !in_emergency {
                        in_emergency = true;
                        let name =
                            triggered.as_ref().map(|c| c.name()).unwrap_or("unknown");
                        tracing::error!(check = name, "SAFETY EMERGENCY, aborting motion");
                        if let Some(abort) = &monitor.abort_callback {
                            abort();
                        }
                    }
                } else {
                    in_emergency = false;
                }
            }
        }));
        tracing::info!(
            interval_s = self.watchdog_interval.as_secs_f64(),
            "safety watchdog started"
        );
    }

    /// Signal the watchdog to stop and join it with a bounded wait.
    pub async fn stop_watchdog(&self) {
        let handle = self.watchdog_handle.lock().expect("watchdog handle lock").take();
        let Some(handle) = handle else { return };
        self.watchdog_stop.store(true, Ordering::SeqCst);

        let grace = self.watchdog_interval + Duration::from_secs(2);
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("safety watchdog did not stop in time, abandoning");
        } else {
            tracing::info!("safety watchdog stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCheck {
        name: &'static str,
        action: SafetyAction,
    }

    impl SafetyCheck for FixedCheck {
        fn name(&self) -> &'static str {
            self.name
        }
        fn check(&self) -> anyhow::Result<SafetyAction> {
            Ok(self.action)
        }
    }

    struct FailingCheck;

    impl SafetyCheck for FailingCheck {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn check(&self) -> anyhow::Result<SafetyAction> {
            anyhow::bail!("device unplugged")
        }
        fn check_proposed_action(&self, _kind: ActionKind) -> anyhow::Result<bool> {
            anyhow::bail!("device unplugged")
        }
    }

    #[test]
    fn evaluate_returns_worst_and_trigger() {
        let monitor = SafetyMonitor::new(
            vec![
                Arc::new(FixedCheck { name: "a", action: SafetyAction::Safe }),
                Arc::new(FixedCheck { name: "b", action: SafetyAction::Emergency }),
                Arc::new(FixedCheck { name: "c", action: SafetyAction::Warn }),
            ],
            None,
        );
        let (worst, trigger) = monitor.evaluate();
        assert_eq!(worst, SafetyAction::Emergency);
        assert_eq!(trigger.unwrap().name(), "b");
    }

    #[test]
    fn erroring_check_is_queue_stop_not_emergency() {
        let monitor = SafetyMonitor::new(
            vec![
                Arc::new(FailingCheck),
                Arc::new(FixedCheck { name: "ok", action: SafetyAction::Safe }),
            ],
            None,
        );
        let (worst, trigger) = monitor.evaluate();
        assert_eq!(worst, SafetyAction::QueueStop);
        assert_eq!(trigger.unwrap().name(), "failing");
    }

    #[test]
    fn erroring_gate_blocks() {
        let monitor = SafetyMonitor::new(vec![Arc::new(FailingCheck)], None);
        assert!(!monitor.is_action_safe(ActionKind::Slew));
    }

    #[test]
    fn gate_passes_when_all_allow() {
        let monitor = SafetyMonitor::new(
            vec![Arc::new(FixedCheck { name: "a", action: SafetyAction::Safe })],
            None,
        );
        assert!(monitor.is_action_safe(ActionKind::Capture));
    }

    #[test]
    fn status_uses_cached_actions() {
        let monitor = SafetyMonitor::new(
            vec![Arc::new(FixedCheck { name: "a", action: SafetyAction::Warn })],
            None,
        );
        // Before any evaluation the cache defaults to Safe.
        assert_eq!(monitor.status().checks[0].action, SafetyAction::Safe);
        monitor.evaluate();
        assert_eq!(monitor.status().checks[0].action, SafetyAction::Warn);
    }

    #[test]
    fn watchdog_unhealthy_before_start() {
        let monitor = SafetyMonitor::new(vec![], None);
        assert!(!monitor.watchdog_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_aborts_once_per_transition() {
        use std::sync::atomic::AtomicUsize;

        struct Latch {
            action: Mutex<SafetyAction>,
        }
        struct LatchCheck(Arc<Latch>);
        impl SafetyCheck for LatchCheck {
            fn name(&self) -> &'static str {
                "latch"
            }
            fn check(&self) -> anyhow::Result<SafetyAction> {
                Ok(*self.0.action.lock().unwrap())
            }
        }

        let latch = Arc::new(Latch { action: Mutex::new(SafetyAction::Emergency) });
        let aborts = Arc::new(AtomicUsize::new(0));
        let aborts_cb = aborts.clone();

        let monitor = Arc::new(SafetyMonitor::new(
            vec![Arc::new(LatchCheck(latch.clone()))],
            Some(Box::new(move || {
                aborts_cb.fetch_add(1, Ordering::SeqCst);
            })),
        ));
        monitor.start_watchdog();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 1, "abort fires once while latched");

        *latch.action.lock().unwrap() = SafetyAction::Safe;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        *latch.action.lock().unwrap() = SafetyAction::Emergency;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(aborts.load(Ordering::SeqCst), 2, "abort fires again after recovery");

        monitor.stop_watchdog().await;
    }
}
