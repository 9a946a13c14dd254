//! Long-running operator/scheduled routines: autofocus, alignment, homing.
//!
//! All three share one shape: an operator (or a schedule) requests the
//! routine, and the runner offers it an execution slot between tasks via
//! `check_and_execute`. The request flag is read-and-cleared atomically;
//! when the imaging queue is still busy the flag is re-armed and the
//! routine waits for the next quiescence window.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use citrascope_core::settings::SettingsStore;

use crate::api::TelescopeDto;
use crate::hardware::HardwareAdapter;

/// How the scheduler's runner sees a routine manager.
#[async_trait]
pub trait RoutineGate: Send + Sync {
    fn is_running(&self) -> bool;
    fn is_requested(&self) -> bool;
    /// Offer an execution slot; returns true when the routine ran.
    async fn check_and_execute(&self) -> bool;
}

type IdleProbe = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct RoutineState {
    requested: bool,
    running: bool,
    progress: String,
}

/// Request/running/progress bookkeeping shared by the managers.
pub struct RoutineCore {
    name: &'static str,
    state: Mutex<RoutineState>,
}

impl RoutineCore {
    fn new(name: &'static str) -> Self {
        Self { name, state: Mutex::new(RoutineState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoutineState> {
        self.state.lock().expect("routine state lock")
    }

    /// Request the routine for the next safe point between tasks.
    pub fn request(&self) -> bool {
        let mut state = self.lock();
        if state.running {
            tracing::info!(routine = self.name, "already in progress");
            return false;
        }
        state.requested = true;
        tracing::info!(routine = self.name, "requested, will run between tasks");
        true
    }

    /// Cancel a pending request. Returns true when one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        let was_requested = state.requested;
        state.requested = false;
        if was_requested {
            tracing::info!(routine = self.name, "request cancelled");
        }
        was_requested
    }

    pub fn is_requested(&self) -> bool {
        self.lock().requested
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn progress(&self) -> String {
        self.lock().progress.clone()
    }

    fn set_progress(&self, msg: &str) {
        self.lock().progress = msg.to_string();
    }

    /// Atomically read and clear the request flag.
    fn take_request(&self) -> bool {
        let mut state = self.lock();
        let requested = state.requested;
        state.requested = false;
        requested
    }

    fn rearm(&self) {
        self.lock().requested = true;
    }

    fn begin(&self, progress: &str) {
        let mut state = self.lock();
        state.running = true;
        state.progress = progress.to_string();
    }

    fn end(&self) {
        let mut state = self.lock();
        state.running = false;
        state.progress.clear();
    }
}

// ---------------------------------------------------------------------------
// Autofocus
// ---------------------------------------------------------------------------

struct TargetPreset {
    key: &'static str,
    name: &'static str,
    designation: &'static str,
    ra_deg: f64,
    dec_deg: f64,
}

/// Bright, well-separated focus stars spread over the northern sky.
const AUTOFOCUS_TARGET_PRESETS: [TargetPreset; 4] = [
    TargetPreset {
        key: "mirach",
        name: "Mirach",
        designation: "Beta Andromedae",
        ra_deg: 17.434,
        dec_deg: 35.620,
    },
    TargetPreset {
        key: "capella",
        name: "Capella",
        designation: "Alpha Aurigae",
        ra_deg: 79.172,
        dec_deg: 45.998,
    },
    TargetPreset {
        key: "vega",
        name: "Vega",
        designation: "Alpha Lyrae",
        ra_deg: 279.235,
        dec_deg: 38.784,
    },
    TargetPreset {
        key: "arcturus",
        name: "Arcturus",
        designation: "Alpha Bootis",
        ra_deg: 213.915,
        dec_deg: 19.182,
    },
];

const DEFAULT_PRESET: &str = "mirach";

/// Manages autofocus requests, scheduling, target resolution, and
/// execution.
pub struct AutofocusManager {
    core: Arc<RoutineCore>,
    adapter: Arc<dyn HardwareAdapter>,
    settings: Arc<SettingsStore>,
    imaging_idle: IdleProbe,
}

impl AutofocusManager {
    pub fn new(
        adapter: Arc<dyn HardwareAdapter>,
        settings: Arc<SettingsStore>,
        imaging_idle: IdleProbe,
    ) -> Self {
        Self { core: Arc::new(RoutineCore::new("autofocus")), adapter, settings, imaging_idle }
    }

    pub fn request(&self) -> bool {
        self.core.request()
    }

    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn progress(&self) -> String {
        self.core.progress()
    }

    /// Scheduled autofocus is due when enabled, supported, and the
    /// configured interval has elapsed (or it has never run).
    fn scheduled_due(&self, now_epoch: i64) -> bool {
        let settings = self.settings.snapshot();
        if !settings.scheduled_autofocus_enabled || !self.adapter.supports_autofocus() {
            return false;
        }
        match settings.last_autofocus_timestamp {
            None => true,
            Some(last) => {
                now_epoch - last >= (settings.autofocus_interval_minutes as i64) * 60
            }
        }
    }

    /// Resolve the focus target from settings: named preset, or `custom`
    /// when both coordinates are present; any ambiguity falls back to the
    /// default preset.
    fn resolve_target(&self) -> (Option<f64>, Option<f64>) {
        let settings = self.settings.snapshot();
        let mut preset_key =
            settings.autofocus_target_preset.clone().unwrap_or_else(|| DEFAULT_PRESET.to_string());

        if preset_key == "custom" {
            if let (Some(ra), Some(dec)) =
                (settings.autofocus_target_custom_ra, settings.autofocus_target_custom_dec)
            {
                tracing::info!(ra, dec, "autofocus target: custom");
                return (Some(ra), Some(dec));
            }
            tracing::warn!("custom autofocus target missing RA/Dec, falling back");
            preset_key = DEFAULT_PRESET.to_string();
        }

        let preset = AUTOFOCUS_TARGET_PRESETS
            .iter()
            .find(|p| p.key == preset_key)
            .unwrap_or_else(|| {
                tracing::warn!(preset = preset_key, "unknown autofocus preset, falling back");
                AUTOFOCUS_TARGET_PRESETS.iter().find(|p| p.key == DEFAULT_PRESET).expect("default preset")
            });
        tracing::info!(target = preset.name, designation = preset.designation, "autofocus target");
        (Some(preset.ra_deg), Some(preset.dec_deg))
    }

    async fn execute(&self) {
        self.core.begin("Starting...");
        let (ra, dec) = self.resolve_target();

        let adapter = self.adapter.clone();
        let core = self.core.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let progress = |msg: &str| core.set_progress(msg);
            adapter.do_autofocus(ra, dec, &progress)
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::info!("autofocus routine completed");
                // Save the filter table the routine may have refined.
                if self.adapter.supports_filter_management() {
                    let filters = self.adapter.get_filter_config();
                    if !filters.is_empty() {
                        match serde_json::to_value(&filters) {
                            Ok(value) => {
                                self.settings.update(|s| {
                                    s.adapter_settings.insert("filters".to_string(), value);
                                });
                                tracing::info!(count = filters.len(), "saved filter configuration");
                            }
                            Err(err) => {
                                tracing::warn!("could not serialize filter configuration: {err}");
                            }
                        }
                    }
                }
            }
            Ok(Err(err)) => tracing::error!("autofocus failed: {err:#}"),
            Err(err) => tracing::error!("autofocus task panicked: {err:#}"),
        }

        self.core.end();
        // Timestamp on success and failure alike, so a broken focuser
        // doesn't retry every runner tick.
        self.settings
            .update(|s| s.last_autofocus_timestamp = Some(chrono::Utc::now().timestamp()));
    }
}

#[async_trait]
impl RoutineGate for AutofocusManager {
    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn is_requested(&self) -> bool {
        self.core.is_requested()
    }

    async fn check_and_execute(&self) -> bool {
        let mut should_run = self.core.take_request();
        if !should_run && self.scheduled_due(chrono::Utc::now().timestamp()) {
            should_run = true;
        }
        if !should_run {
            return false;
        }

        if !(self.imaging_idle)() {
            tracing::info!("autofocus deferred, waiting for imaging queue to drain");
            self.core.rearm();
            return false;
        }

        self.execute().await;
        true
    }
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

/// Blind plate-solve contract used by alignment. The solver itself (local
/// astrometry.net, ASTAP, ...) is an external collaborator.
pub trait PlateSolver: Send + Sync {
    /// Solve an image; `Ok(None)` means no solution was found.
    fn solve(&self, image: &Path, telescope: &TelescopeDto) -> anyhow::Result<Option<(f64, f64)>>;
}

/// Stand-in when no solver is configured: alignment always reports "no
/// solution" and leaves the mount untouched.
pub struct UnconfiguredSolver;

impl PlateSolver for UnconfiguredSolver {
    fn solve(
        &self,
        _image: &Path,
        _telescope: &TelescopeDto,
    ) -> anyhow::Result<Option<(f64, f64)>> {
        tracing::warn!("no plate solver configured, alignment cannot run");
        Ok(None)
    }
}

/// On-demand plate-solve-and-sync: expose at the current position, solve
/// blind, sync the mount. No slew involved.
pub struct AlignmentManager {
    core: Arc<RoutineCore>,
    adapter: Arc<dyn HardwareAdapter>,
    solver: Arc<dyn PlateSolver>,
    telescope: TelescopeDto,
    settings: Arc<SettingsStore>,
    imaging_idle: IdleProbe,
}

impl AlignmentManager {
    pub fn new(
        adapter: Arc<dyn HardwareAdapter>,
        solver: Arc<dyn PlateSolver>,
        telescope: TelescopeDto,
        settings: Arc<SettingsStore>,
        imaging_idle: IdleProbe,
    ) -> Self {
        Self {
            core: Arc::new(RoutineCore::new("alignment")),
            adapter,
            solver,
            telescope,
            settings,
            imaging_idle,
        }
    }

    pub fn request(&self) -> bool {
        self.core.request()
    }

    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn progress(&self) -> String {
        self.core.progress()
    }

    async fn execute(&self) {
        let exposure_s = self.settings.snapshot().alignment_exposure_s;
        self.core.begin(&format!("Exposing ({exposure_s:.0}s)..."));

        let adapter = self.adapter.clone();
        let solver = self.solver.clone();
        let telescope = self.telescope.clone();
        let core = self.core.clone();
        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let paths = adapter
                .take_image("alignment", exposure_s)
                .map_err(|err| anyhow::anyhow!("alignment exposure failed: {err}"))?;
            let image = paths
                .first()
                .ok_or_else(|| anyhow::anyhow!("alignment exposure produced no file"))?;

            core.set_progress("Plate solving...");
            let Some((ra, dec)) = solver.solve(image, &telescope)? else {
                anyhow::bail!("plate solve returned no solution");
            };

            core.set_progress("Syncing mount...");
            adapter
                .sync_to_radec(ra, dec)
                .map_err(|err| anyhow::anyhow!("mount sync failed: {err}"))?;
            tracing::info!(ra, dec, "alignment successful, mount synced");
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("alignment failed: {err:#}"),
            Err(err) => tracing::error!("alignment task panicked: {err:#}"),
        }

        self.core.end();
        self.settings
            .update(|s| s.last_alignment_timestamp = Some(chrono::Utc::now().timestamp()));
    }
}

#[async_trait]
impl RoutineGate for AlignmentManager {
    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn is_requested(&self) -> bool {
        self.core.is_requested()
    }

    async fn check_and_execute(&self) -> bool {
        if !self.core.take_request() {
            return false;
        }
        if !(self.imaging_idle)() {
            tracing::info!("alignment deferred, waiting for imaging queue to drain");
            self.core.rearm();
            return false;
        }
        self.execute().await;
        true
    }
}

// ---------------------------------------------------------------------------
// Homing
// ---------------------------------------------------------------------------

const HOME_TIMEOUT: Duration = Duration::from_secs(120);
/// Polls before premature-stop detection engages (motion needs time to
/// start).
const HOME_GRACE_POLLS: u32 = 5;
/// Consecutive idle polls that declare the homing run interrupted.
const HOME_IDLE_THRESHOLD: u32 = 3;

/// Operator-requested find-home. The mount firmware is the authority on
/// calibration state; this just drives and supervises the routine.
pub struct HomingManager {
    core: Arc<RoutineCore>,
    adapter: Arc<dyn HardwareAdapter>,
    imaging_idle: IdleProbe,
    poll_interval: Duration,
}

impl HomingManager {
    pub fn new(adapter: Arc<dyn HardwareAdapter>, imaging_idle: IdleProbe) -> Self {
        Self::with_poll_interval(adapter, imaging_idle, Duration::from_secs(1))
    }

    pub fn with_poll_interval(
        adapter: Arc<dyn HardwareAdapter>,
        imaging_idle: IdleProbe,
        poll_interval: Duration,
    ) -> Self {
        Self {
            core: Arc::new(RoutineCore::new("homing")),
            adapter,
            imaging_idle,
            poll_interval,
        }
    }

    pub fn request(&self) -> bool {
        self.core.request()
    }

    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn progress(&self) -> String {
        self.core.progress()
    }

    async fn execute(&self) {
        self.core.begin("Homing...");
        let adapter = self.adapter.clone();
        let poll_interval = self.poll_interval;

        let outcome = tokio::task::spawn_blocking(move || {
            tracing::info!("mount homing: initiating find-home");
            if !adapter.home_mount() {
                tracing::error!("mount does not support homing or homing failed to initiate");
                return;
            }

            let deadline = std::time::Instant::now() + HOME_TIMEOUT;
            let mut poll_count = 0u32;
            let mut idle_count = 0u32;
            while std::time::Instant::now() < deadline {
                if adapter.is_telescope_connected() && adapter.is_mount_homed() {
                    tracing::info!("mount homing complete, encoder position established");
                    return;
                }

                poll_count += 1;
                // Watch for the mount stopping without reaching home (e.g.
                // a safety abort mid-homing) so the UI doesn't spin for the
                // full timeout.
                if poll_count > HOME_GRACE_POLLS {
                    let still_moving = adapter.telescope_is_moving().unwrap_or(true);
                    if !still_moving {
                        idle_count += 1;
                        if idle_count >= HOME_IDLE_THRESHOLD {
                            tracing::warn!(
                                poll = poll_count,
                                "mount stopped without reaching home, homing interrupted"
                            );
                            return;
                        }
                    } else {
                        idle_count = 0;
                    }
                }

                std::thread::sleep(poll_interval);
            }
            tracing::error!(timeout_s = HOME_TIMEOUT.as_secs(), "mount homing timed out");
        })
        .await;

        if let Err(err) = outcome {
            tracing::error!("homing task panicked: {err:#}");
        }
        self.core.end();
    }
}

#[async_trait]
impl RoutineGate for HomingManager {
    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn is_requested(&self) -> bool {
        self.core.is_requested()
    }

    async fn check_and_execute(&self) -> bool {
        if !self.core.take_request() {
            return false;
        }
        if !(self.imaging_idle)() {
            tracing::info!("homing deferred, waiting for imaging queue to drain");
            self.core.rearm();
            return false;
        }
        self.execute().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citrascope_core::settings::Settings;

    use crate::hardware::sim::SimAdapter;

    fn settings_store() -> Arc<SettingsStore> {
        Arc::new(SettingsStore::new(Settings::default(), None))
    }

    fn sim() -> (Arc<SimAdapter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(SimAdapter::new(dir.path().to_path_buf()));
        adapter.connect().unwrap();
        (adapter, dir)
    }

    #[tokio::test]
    async fn not_requested_does_not_run() {
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings_store(), Box::new(|| true));
        assert!(!manager.check_and_execute().await);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn request_runs_when_idle_and_clears_flag() {
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings_store(), Box::new(|| true));
        assert!(manager.request());
        assert!(manager.is_requested());
        assert!(manager.check_and_execute().await);
        assert!(!manager.is_requested());
        assert!(!manager.is_running());
        // Completion stamps the settings and saves the filter table the
        // sim adapter manages.
        let snapshot = manager.settings.snapshot();
        assert!(snapshot.last_autofocus_timestamp.is_some());
        assert!(snapshot.adapter_settings.contains_key("filters"));
    }

    #[tokio::test]
    async fn busy_imaging_queue_defers_and_rearms() {
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings_store(), Box::new(|| false));
        manager.request();
        assert!(!manager.check_and_execute().await);
        assert!(manager.is_requested(), "request re-armed for the next window");
    }

    #[tokio::test]
    async fn cancel_clears_pending_request() {
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings_store(), Box::new(|| true));
        manager.request();
        assert!(manager.cancel());
        assert!(!manager.cancel(), "second cancel has nothing to do");
        assert!(!manager.check_and_execute().await);
    }

    #[tokio::test]
    async fn scheduled_autofocus_runs_when_interval_elapsed() {
        let settings = settings_store();
        settings.update(|s| {
            s.scheduled_autofocus_enabled = true;
            s.autofocus_interval_minutes = 60;
            s.last_autofocus_timestamp = Some(chrono::Utc::now().timestamp() - 3700);
        });
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings, Box::new(|| true));
        assert!(manager.check_and_execute().await, "due by schedule without a request");
    }

    #[tokio::test]
    async fn scheduled_autofocus_respects_interval() {
        let settings = settings_store();
        settings.update(|s| {
            s.scheduled_autofocus_enabled = true;
            s.autofocus_interval_minutes = 60;
            s.last_autofocus_timestamp = Some(chrono::Utc::now().timestamp() - 60);
        });
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings, Box::new(|| true));
        assert!(!manager.check_and_execute().await);
    }

    #[test]
    fn target_resolution_prefers_custom_then_falls_back() {
        let settings = settings_store();
        settings.update(|s| {
            s.autofocus_target_preset = Some("custom".into());
            s.autofocus_target_custom_ra = Some(100.0);
            s.autofocus_target_custom_dec = Some(-20.0);
        });
        let (adapter, _dir) = sim();
        let manager = AutofocusManager::new(adapter, settings.clone(), Box::new(|| true));
        assert_eq!(manager.resolve_target(), (Some(100.0), Some(-20.0)));

        // Ambiguous custom target falls back to the default preset.
        settings.update(|s| s.autofocus_target_custom_dec = None);
        let (ra, dec) = manager.resolve_target();
        assert_eq!((ra, dec), (Some(17.434), Some(35.620)));

        settings.update(|s| s.autofocus_target_preset = Some("vega".into()));
        assert_eq!(manager.resolve_target(), (Some(279.235), Some(38.784)));

        settings.update(|s| s.autofocus_target_preset = Some("no-such-star".into()));
        assert_eq!(manager.resolve_target(), (Some(17.434), Some(35.620)));
    }

    struct FixedSolver(Option<(f64, f64)>);
    impl PlateSolver for FixedSolver {
        fn solve(
            &self,
            _image: &Path,
            _telescope: &TelescopeDto,
        ) -> anyhow::Result<Option<(f64, f64)>> {
            Ok(self.0)
        }
    }

    fn telescope() -> TelescopeDto {
        TelescopeDto {
            id: "tel".into(),
            name: "Tel".into(),
            ground_station_id: "gs".into(),
            automated_scheduling: true,
            max_slew_rate: Some(5.0),
            angular_noise: None,
            spectral_min_wavelength_nm: None,
            spectral_max_wavelength_nm: None,
        }
    }

    #[tokio::test]
    async fn alignment_solves_and_syncs() {
        let (adapter, _dir) = sim();
        let manager = AlignmentManager::new(
            adapter.clone(),
            Arc::new(FixedSolver(Some((111.0, 22.0)))),
            telescope(),
            settings_store(),
            Box::new(|| true),
        );
        manager.request();
        assert!(manager.check_and_execute().await);
        assert_eq!(adapter.get_telescope_direction().unwrap(), (111.0, 22.0));
    }

    #[tokio::test]
    async fn alignment_without_solution_leaves_mount_alone() {
        let (adapter, _dir) = sim();
        adapter.sync_to_radec(5.0, 5.0).unwrap();
        let manager = AlignmentManager::new(
            adapter.clone(),
            Arc::new(FixedSolver(None)),
            telescope(),
            settings_store(),
            Box::new(|| true),
        );
        manager.request();
        assert!(manager.check_and_execute().await);
        assert_eq!(adapter.get_telescope_direction().unwrap(), (5.0, 5.0));
    }

    #[tokio::test]
    async fn homing_completes_against_sim_mount() {
        let (adapter, _dir) = sim();
        let manager = HomingManager::with_poll_interval(
            adapter.clone(),
            Box::new(|| true),
            Duration::from_millis(5),
        );
        manager.request();
        assert!(manager.check_and_execute().await);
        assert!(adapter.is_mount_homed());
        assert!(!manager.is_running());
    }
}
