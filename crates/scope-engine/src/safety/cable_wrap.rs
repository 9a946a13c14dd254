//! Cable wrap safety check: cumulative azimuth rotation in alt-az mode.
//!
//! Every tick reads the current azimuth, accumulates the signed
//! shortest-arc delta from the previous reading, persists the running
//! total, and enforces two limits. When asked, it performs a defensive
//! directional unwind back toward neutral.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use citrascope_core::angles::shortest_arc_deg;
use serde::{Deserialize, Serialize};

use crate::hardware::{HardwareAdapter, MountMode, MoveDirection};
use crate::safety::{ActionKind, SafetyAction, SafetyCheck};

/// At this cumulative rotation new work stops (QUEUE_STOP). Inclusive.
pub const SOFT_LIMIT_DEG: f64 = 180.0;
/// At this cumulative rotation the watchdog aborts motion (EMERGENCY).
/// Inclusive.
pub const HARD_LIMIT_DEG: f64 = 270.0;

/// A single slew can add up to ~180° of wrap, and the target azimuth isn't
/// known at gate time. Slews are blocked when headroom to the soft limit
/// drops below this margin.
const SLEW_BLOCK_MARGIN_DEG: f64 = 10.0;

const UNWIND_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STALL_THRESHOLD_DEG: f64 = 1.0;
const STALL_READINGS: usize = 3;
const TRAVEL_BUDGET_DEG: f64 = 360.0;
const CONVERGENCE_DEG: f64 = 5.0;
const UNWIND_RATE: u8 = 7;

#[derive(Debug, Serialize, Deserialize)]
struct WrapStateFile {
    cumulative_deg: f64,
}

#[derive(Debug)]
struct WrapState {
    cumulative_deg: f64,
    last_az: Option<f64>,
    unwinding: bool,
}

/// Monitors cumulative azimuth rotation and unwinds when limits are hit.
///
/// Mounts that don't report azimuth (or aren't alt-az) are silently
/// excluded: the check always reads SAFE for them.
pub struct CableWrapCheck {
    mount: Arc<dyn HardwareAdapter>,
    state_file: Option<PathBuf>,
    poll_interval: Duration,
    state: Mutex<WrapState>,
}

impl CableWrapCheck {
    pub fn new(mount: Arc<dyn HardwareAdapter>, state_file: Option<PathBuf>) -> Self {
        Self::with_poll_interval(mount, state_file, UNWIND_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        mount: Arc<dyn HardwareAdapter>,
        state_file: Option<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        let check = Self {
            mount,
            state_file,
            poll_interval,
            state: Mutex::new(WrapState { cumulative_deg: 0.0, last_az: None, unwinding: false }),
        };
        check.load_state();
        check
    }

    pub fn cumulative_deg(&self) -> f64 {
        self.state.lock().expect("wrap state lock").cumulative_deg
    }

    #[cfg(test)]
    fn set_cumulative_for_tests(&self, cumulative_deg: f64) {
        self.state.lock().expect("wrap state lock").cumulative_deg = cumulative_deg;
    }

    fn save_state(&self, cumulative_deg: f64) {
        let Some(path) = &self.state_file else { return };
        let result = (|| -> anyhow::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let json = serde_json::to_string(&WrapStateFile { cumulative_deg })?;
            std::fs::write(path, json)?;
            Ok(())
        })();
        if let Err(err) = result {
            // The on-disk copy goes stale rather than blocking the tick.
            tracing::debug!("failed to persist cable wrap state: {err:#}");
        }
    }

    fn load_state(&self) {
        let Some(path) = &self.state_file else { return };
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cable wrap state file not found, operator should verify cables are unwound"
            );
            return;
        }
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<WrapStateFile>(&raw)?))
        {
            Ok(file) => {
                self.state.lock().expect("wrap state lock").cumulative_deg = file.cumulative_deg;
                tracing::info!(cumulative_deg = file.cumulative_deg, "loaded cable wrap state");
            }
            Err(err) => {
                tracing::warn!("failed to load cable wrap state: {err:#}");
            }
        }
    }

    fn mount_radec_for_log(&self) -> String {
        match self.mount.cached_direction() {
            Some((ra, dec)) => format!("{ra:.2}/{dec:.2}"),
            None => "n/a".to_string(),
        }
    }

    fn do_unwind(&self) {
        let start_az = self.mount.azimuth();
        let start_cumulative = self.cumulative_deg();
        let direction =
            if start_cumulative > 0.0 { MoveDirection::West } else { MoveDirection::East };
        tracing::warn!(
            cumulative_deg = start_cumulative,
            az = start_az.unwrap_or(0.0),
            radec = self.mount_radec_for_log(),
            ?direction,
            "starting cable unwind"
        );

        self.mount.stop_tracking();

        if !self.mount.start_move(direction, UNWIND_RATE) {
            tracing::error!("mount does not support directional motion, cannot unwind");
            return;
        }

        let mut recent_readings: Vec<f64> = Vec::new();
        let mut travel = 0.0_f64;
        let mut poll_count = 0_u32;

        loop {
            std::thread::sleep(self.poll_interval);
            poll_count += 1;

            let Some(az) = self.mount.azimuth() else {
                tracing::error!("lost azimuth reading during unwind, stopping");
                break;
            };

            let cumulative = {
                let mut state = self.state.lock().expect("wrap state lock");
                if let Some(last) = state.last_az {
                    let delta = shortest_arc_deg(last, az);
                    state.cumulative_deg += delta;
                    travel += delta.abs();
                }
                state.last_az = Some(az);
                state.cumulative_deg
            };

            tracing::info!(
                poll = poll_count,
                az,
                cumulative_deg = cumulative,
                travel_deg = travel,
                radec = self.mount_radec_for_log(),
                "unwind poll"
            );

            // Stall detection over wrapped pairwise deltas so readings near
            // the 0/360 boundary (e.g. [359.5, 0.0, 0.5]) don't produce a
            // false 359° span.
            recent_readings.push(az);
            if recent_readings.len() > STALL_READINGS {
                recent_readings.remove(0);
            }
            if recent_readings.len() == STALL_READINGS {
                let max_step = recent_readings
                    .windows(2)
                    .map(|w| shortest_arc_deg(w[0], w[1]).abs())
                    .fold(0.0_f64, f64::max);
                if max_step < STALL_THRESHOLD_DEG {
                    tracing::error!(
                        max_step_deg = max_step,
                        readings = STALL_READINGS,
                        "unwind stall detected, possible cable binding or obstruction"
                    );
                    break;
                }
            }

            if travel > TRAVEL_BUDGET_DEG {
                tracing::error!(
                    travel_deg = travel,
                    budget_deg = TRAVEL_BUDGET_DEG,
                    "unwind travel budget exceeded, stopping"
                );
                break;
            }

            if cumulative.abs() < CONVERGENCE_DEG {
                tracing::info!(cumulative_deg = cumulative, "cable unwind converged");
                break;
            }
        }

        self.mount.stop_move(direction);
        let end_az = self.mount.azimuth();
        tracing::info!(
            polls = poll_count,
            travel_deg = travel,
            start_az = start_az.unwrap_or(0.0),
            end_az = end_az.unwrap_or(0.0),
            radec = self.mount_radec_for_log(),
            "cable unwind complete, resetting cumulative to 0"
        );
        self.reset();
    }
}

impl SafetyCheck for CableWrapCheck {
    fn name(&self) -> &'static str {
        "cable_wrap"
    }

    fn check(&self) -> anyhow::Result<SafetyAction> {
        let cumulative = {
            let mut state = self.state.lock().expect("wrap state lock");
            if state.unwinding {
                // QUEUE_STOP, not EMERGENCY, so the watchdog doesn't fight
                // the unwind with an abort.
                return Ok(SafetyAction::QueueStop);
            }

            if self.mount.mount_mode() != MountMode::AltAz {
                return Ok(SafetyAction::Safe);
            }
            let Some(az) = self.mount.azimuth() else {
                return Ok(SafetyAction::Safe);
            };

            if let Some(last) = state.last_az {
                let delta = shortest_arc_deg(last, az);
                state.cumulative_deg += delta;
            }
            state.last_az = Some(az);
            state.cumulative_deg
        };

        // Persisted outside the lock.
        self.save_state(cumulative);

        let abs = cumulative.abs();
        if abs >= HARD_LIMIT_DEG {
            tracing::error!(cumulative_deg = cumulative, limit = HARD_LIMIT_DEG, "cable wrap hard limit");
            return Ok(SafetyAction::Emergency);
        }
        if abs >= SOFT_LIMIT_DEG {
            tracing::warn!(cumulative_deg = cumulative, limit = SOFT_LIMIT_DEG, "cable wrap soft limit");
            return Ok(SafetyAction::QueueStop);
        }
        Ok(SafetyAction::Safe)
    }

    fn check_proposed_action(&self, kind: ActionKind) -> anyhow::Result<bool> {
        let state = self.state.lock().expect("wrap state lock");
        if state.unwinding {
            return Ok(false);
        }
        if kind == ActionKind::Slew {
            let abs = state.cumulative_deg.abs();
            if abs >= SOFT_LIMIT_DEG {
                return Ok(false);
            }
            let headroom = SOFT_LIMIT_DEG - abs;
            if headroom < SLEW_BLOCK_MARGIN_DEG {
                tracing::warn!(
                    headroom_deg = headroom,
                    margin_deg = SLEW_BLOCK_MARGIN_DEG,
                    "slew blocked, not enough headroom before soft limit"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn has_corrective_action(&self) -> bool {
        true
    }

    /// Defensive directional unwind. Blocking; guarded against re-entry.
    fn execute_action(&self) {
        {
            let mut state = self.state.lock().expect("wrap state lock");
            if state.unwinding {
                return;
            }
            state.unwinding = true;
        }
        self.do_unwind();
        self.state.lock().expect("wrap state lock").unwinding = false;
    }

    fn reset(&self) {
        let cumulative = {
            let mut state = self.state.lock().expect("wrap state lock");
            state.cumulative_deg = 0.0;
            state.last_az = None;
            state.cumulative_deg
        };
        self.save_state(cumulative);
    }

    fn status(&self) -> serde_json::Value {
        let state = self.state.lock().expect("wrap state lock");
        serde_json::json!({
            "cumulative_deg": (state.cumulative_deg * 10.0).round() / 10.0,
            "soft_limit": SOFT_LIMIT_DEG,
            "hard_limit": HARD_LIMIT_DEG,
            "unwinding": state.unwinding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::hardware::{HardwareError, HwResult};

    /// Mount whose azimuth readings replay a scripted sequence; the last
    /// value repeats once the script runs dry (unless `fail_when_empty`).
    struct ScriptedMount {
        script: Mutex<VecDeque<f64>>,
        last: Mutex<Option<f64>>,
        mode: MountMode,
        fail_when_empty: bool,
        reads: AtomicUsize,
        move_supported: bool,
    }

    impl ScriptedMount {
        fn new(values: &[f64]) -> Self {
            Self {
                script: Mutex::new(values.iter().copied().collect()),
                last: Mutex::new(None),
                mode: MountMode::AltAz,
                fail_when_empty: false,
                reads: AtomicUsize::new(0),
                move_supported: true,
            }
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl HardwareAdapter for ScriptedMount {
        fn connect(&self) -> HwResult<bool> {
            Ok(true)
        }
        fn disconnect(&self) {}
        fn is_telescope_connected(&self) -> bool {
            true
        }
        fn is_camera_connected(&self) -> bool {
            false
        }
        fn list_devices(&self) -> Vec<String> {
            vec![]
        }
        fn point_telescope(&self, _ra: f64, _dec: f64) -> HwResult<()> {
            Err(HardwareError::NotSupported("slew"))
        }
        fn get_telescope_direction(&self) -> HwResult<(f64, f64)> {
            Ok((0.0, 0.0))
        }
        fn telescope_is_moving(&self) -> HwResult<bool> {
            Ok(false)
        }
        fn abort_motion(&self) {}
        fn slew_rate_deg_per_s(&self) -> f64 {
            5.0
        }
        fn take_image(&self, _task_id: &str, _exposure_s: f64) -> HwResult<Vec<PathBuf>> {
            Err(HardwareError::NotSupported("camera"))
        }
        fn set_custom_tracking_rate(&self, _ra: f64, _dec: f64) -> HwResult<()> {
            Ok(())
        }
        fn get_tracking_rate(&self) -> HwResult<(f64, f64)> {
            Ok((0.0, 0.0))
        }
        fn stop_tracking(&self) {}

        fn mount_mode(&self) -> MountMode {
            self.mode
        }

        fn azimuth(&self) -> Option<f64> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(az) => {
                    *self.last.lock().unwrap() = Some(az);
                    Some(az)
                }
                None if self.fail_when_empty => None,
                None => *self.last.lock().unwrap(),
            }
        }

        fn start_move(&self, _direction: MoveDirection, _rate: u8) -> bool {
            self.move_supported
        }
        fn stop_move(&self, _direction: MoveDirection) {}
    }

    fn fast_check(mount: Arc<ScriptedMount>) -> CableWrapCheck {
        CableWrapCheck::with_poll_interval(mount, None, Duration::from_millis(1))
    }

    #[test]
    fn equatorial_mode_always_safe() {
        let mut mount = ScriptedMount::new(&[0.0, 90.0, 180.0]);
        mount.mode = MountMode::Equatorial;
        let check = fast_check(Arc::new(mount));
        for _ in 0..3 {
            assert_eq!(check.check().unwrap(), SafetyAction::Safe);
        }
        assert_eq!(check.cumulative_deg(), 0.0);
    }

    #[test]
    fn no_azimuth_always_safe() {
        let mut mount = ScriptedMount::new(&[]);
        mount.fail_when_empty = true;
        let check = fast_check(Arc::new(mount));
        assert_eq!(check.check().unwrap(), SafetyAction::Safe);
    }

    #[test]
    fn accumulation_uses_wrapped_deltas() {
        let mount = Arc::new(ScriptedMount::new(&[350.0, 10.0, 30.0]));
        let check = fast_check(mount);
        check.check().unwrap(); // baseline
        check.check().unwrap(); // 350 -> 10 = +20 through zero
        check.check().unwrap(); // 10 -> 30 = +20
        assert!((check.cumulative_deg() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn soft_limit_exactly_180_is_queue_stop() {
        let mount = Arc::new(ScriptedMount::new(&[0.0, 90.0, 180.0]));
        let check = fast_check(mount);
        assert_eq!(check.check().unwrap(), SafetyAction::Safe);
        assert_eq!(check.check().unwrap(), SafetyAction::Safe);
        assert_eq!(check.check().unwrap(), SafetyAction::QueueStop);
        assert_eq!(check.cumulative_deg(), 180.0);
    }

    #[test]
    fn hard_limit_exactly_270_is_emergency() {
        let mount = Arc::new(ScriptedMount::new(&[0.0, 90.0, 180.0, 270.0]));
        let check = fast_check(mount);
        for _ in 0..3 {
            check.check().unwrap();
        }
        assert_eq!(check.check().unwrap(), SafetyAction::Emergency);
        assert_eq!(check.cumulative_deg(), 270.0);
    }

    #[test]
    fn negative_accumulation_hits_limits_too() {
        let mount = Arc::new(ScriptedMount::new(&[0.0, 270.0, 180.0]));
        let check = fast_check(mount);
        check.check().unwrap();
        check.check().unwrap(); // 0 -> 270 = -90
        assert_eq!(check.check().unwrap(), SafetyAction::QueueStop); // -180
        assert_eq!(check.cumulative_deg(), -180.0);
    }

    #[test]
    fn slew_gate_headroom_margin() {
        let mount = Arc::new(ScriptedMount::new(&[]));
        let check = fast_check(mount);

        check.set_cumulative_for_tests(100.0);
        assert!(check.check_proposed_action(ActionKind::Slew).unwrap());

        // 171° leaves 9° of headroom, inside the 10° margin.
        check.set_cumulative_for_tests(171.0);
        assert!(!check.check_proposed_action(ActionKind::Slew).unwrap());

        // 169° leaves 11°, just outside the margin.
        check.set_cumulative_for_tests(169.0);
        assert!(check.check_proposed_action(ActionKind::Slew).unwrap());

        check.set_cumulative_for_tests(185.0);
        assert!(!check.check_proposed_action(ActionKind::Slew).unwrap());

        // Captures are never gated on wrap.
        assert!(check.check_proposed_action(ActionKind::Capture).unwrap());
    }

    #[test]
    fn save_and_reload_cumulative() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("cable_wrap.json");

        let mount = Arc::new(ScriptedMount::new(&[0.0, 45.0]));
        let check = CableWrapCheck::with_poll_interval(
            mount,
            Some(state_file.clone()),
            Duration::from_millis(1),
        );
        check.check().unwrap();
        check.check().unwrap();
        assert_eq!(check.cumulative_deg(), 45.0);

        let reloaded = CableWrapCheck::with_poll_interval(
            Arc::new(ScriptedMount::new(&[])),
            Some(state_file),
            Duration::from_millis(1),
        );
        assert_eq!(reloaded.cumulative_deg(), 45.0);
    }

    #[test]
    fn missing_state_file_operates_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let check = CableWrapCheck::with_poll_interval(
            Arc::new(ScriptedMount::new(&[0.0, 10.0])),
            Some(dir.path().join("absent.json")),
            Duration::from_millis(1),
        );
        assert_eq!(check.cumulative_deg(), 0.0);
        check.check().unwrap();
        check.check().unwrap();
        assert_eq!(check.cumulative_deg(), 10.0);
    }

    #[test]
    fn unwind_scenario_winds_down_and_resets() {
        // Wind up to 181° over seven ticks, then unwind back toward zero.
        let wind = [0.0, 30.0, 60.0, 90.0, 120.0, 150.0, 181.0];
        let unwind = [170.0, 140.0, 110.0, 80.0, 50.0, 20.0, 5.0];
        let script: Vec<f64> = wind.iter().chain(unwind.iter()).copied().collect();

        let mount = Arc::new(ScriptedMount::new(&script));
        let check = fast_check(mount);

        let mut last = SafetyAction::Safe;
        for _ in 0..wind.len() {
            last = check.check().unwrap();
        }
        assert_eq!(last, SafetyAction::QueueStop);
        assert!((check.cumulative_deg() - 181.0).abs() < 1e-9);

        check.execute_action();
        assert_eq!(check.cumulative_deg(), 0.0, "unwind resets cumulative");
        // Fresh baseline afterwards: next check re-seeds last_az.
        assert_eq!(check.check().unwrap(), SafetyAction::Safe);
    }

    #[test]
    fn check_reports_queue_stop_while_unwinding() {
        let mount = Arc::new(ScriptedMount::new(&[]));
        let check = fast_check(mount);
        check.state.lock().unwrap().unwinding = true;
        assert_eq!(check.check().unwrap(), SafetyAction::QueueStop);
        assert!(!check.check_proposed_action(ActionKind::Slew).unwrap());
        assert!(!check.check_proposed_action(ActionKind::Capture).unwrap());
    }

    #[test]
    fn stall_detected_near_zero_boundary() {
        // Readings within ±1° straddling 0/360 must stall quickly instead
        // of being misread as a 359° span of motion.
        let mount = Arc::new(ScriptedMount::new(&[359.5, 0.0, 0.5, 0.3, 0.1, 0.4]));
        let check = fast_check(mount.clone());
        check.set_cumulative_for_tests(200.0);

        check.execute_action();
        // Stall window is 3 readings; allow the baseline read plus slack.
        assert!(mount.reads() <= 6, "stalled late: {} azimuth reads", mount.reads());
        assert_eq!(check.cumulative_deg(), 0.0, "unwind exit always resets");
    }

    #[test]
    fn real_motion_is_not_flagged_as_stall() {
        // 30° steps walking down; exits on convergence near zero.
        let mount =
            Arc::new(ScriptedMount::new(&[150.0, 120.0, 90.0, 60.0, 30.0, 10.0, 2.0, 2.0, 2.0]));
        let check = fast_check(mount.clone());
        check.set_cumulative_for_tests(150.0);
        check.state.lock().unwrap().last_az = Some(150.0);

        check.execute_action();
        // Convergence happens at the 2.0 reading (cumulative 2.0 < 5.0);
        // the trailing repeats must not be consumed by a stall window.
        assert!(mount.reads() >= 7, "exited early after {} reads", mount.reads());
        assert_eq!(check.cumulative_deg(), 0.0);
    }

    #[test]
    fn unwind_travel_budget_bounds_runaway() {
        // Oscillating readings never converge and never stall; the travel
        // budget must end the unwind.
        let script: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.0 } else { 90.0 }).collect();
        let mount = Arc::new(ScriptedMount::new(&script));
        let check = fast_check(mount.clone());
        check.set_cumulative_for_tests(120.0);
        check.state.lock().unwrap().last_az = Some(0.0);

        check.execute_action();
        assert!(
            mount.reads() < 12,
            "travel budget should end the unwind, took {} reads",
            mount.reads()
        );
    }

    #[test]
    fn unwind_stops_when_azimuth_lost() {
        let mut mount = ScriptedMount::new(&[100.0, 90.0]);
        mount.fail_when_empty = true;
        let mount = Arc::new(mount);
        let check = fast_check(mount);
        check.set_cumulative_for_tests(100.0);

        check.execute_action();
        assert_eq!(check.cumulative_deg(), 0.0);
    }

    #[test]
    fn unwind_without_directional_motion_support() {
        let mut mount = ScriptedMount::new(&[100.0]);
        mount.move_supported = false;
        let check = fast_check(Arc::new(mount));
        check.set_cumulative_for_tests(100.0);

        check.execute_action();
        // No motion possible: cumulative untouched, no reset.
        assert_eq!(check.cumulative_deg(), 100.0);
        assert!(!check.status()["unwinding"].as_bool().unwrap());
    }

    #[test]
    fn reset_clears_state() {
        let mount = Arc::new(ScriptedMount::new(&[0.0, 90.0]));
        let check = fast_check(mount);
        check.check().unwrap();
        check.check().unwrap();
        assert_eq!(check.cumulative_deg(), 90.0);
        check.reset();
        assert_eq!(check.cumulative_deg(), 0.0);
    }
}
