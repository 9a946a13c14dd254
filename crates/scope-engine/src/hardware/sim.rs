//! Simulated hardware adapter.
//!
//! Behaves like a cooperative alt-az GoTo mount with a camera: slews take a
//! configurable (short) time, captures produce real minimal FITS files, and
//! test hooks allow scripting azimuth and mount mode. Used by `--simulate`
//! and throughout the test suites.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::SatelliteDto;
use crate::hardware::{
    FilterConfig, HardwareAdapter, HwResult, MountMode, MoveDirection, ObservationStrategy,
};

/// Degrees per second of simulated continuous motion (`start_move`).
const SIM_MOVE_RATE_DEG_S: f64 = 30.0;

#[derive(Debug)]
struct SimState {
    connected: bool,
    ra_deg: f64,
    dec_deg: f64,
    az_deg: f64,
    alt_deg: f64,
    mode: MountMode,
    slewing_until: Option<Instant>,
    tracking: bool,
    tracking_rate: (f64, f64),
    homed: bool,
    moving: Option<(MoveDirection, Instant)>,
    capture_count: u64,
    last_plate_solve: Option<(f64, f64)>,
    filters: BTreeMap<String, FilterConfig>,
}

/// Deterministic in-process stand-in for real devices.
pub struct SimAdapter {
    images_dir: PathBuf,
    slew_duration: Duration,
    state: Mutex<SimState>,
}

impl SimAdapter {
    pub fn new(images_dir: PathBuf) -> Self {
        Self::with_slew_duration(images_dir, Duration::from_millis(20))
    }

    pub fn with_slew_duration(images_dir: PathBuf, slew_duration: Duration) -> Self {
        let mut filters = BTreeMap::new();
        filters.insert(
            "1".to_string(),
            FilterConfig { name: "Luminance".into(), focus_position: 9000, enabled: true },
        );
        filters.insert(
            "2".to_string(),
            FilterConfig { name: "Red".into(), focus_position: 9050, enabled: true },
        );

        Self {
            images_dir,
            slew_duration,
            state: Mutex::new(SimState {
                connected: false,
                ra_deg: 0.0,
                dec_deg: 0.0,
                az_deg: 0.0,
                alt_deg: 45.0,
                mode: MountMode::AltAz,
                slewing_until: None,
                tracking: false,
                tracking_rate: (0.0, 0.0),
                homed: false,
                moving: None,
                capture_count: 0,
                last_plate_solve: None,
                filters,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock")
    }

    /// Test hook: place the simulated mount at an azimuth.
    pub fn set_azimuth(&self, az_deg: f64) {
        self.lock().az_deg = az_deg.rem_euclid(360.0);
    }

    /// Test hook: switch the simulated mount geometry.
    pub fn set_mount_mode(&self, mode: MountMode) {
        self.lock().mode = mode;
    }

    /// Most recent plate-solve feedback, if any was applied.
    pub fn last_plate_solve(&self) -> Option<(f64, f64)> {
        self.lock().last_plate_solve
    }

    /// Advance simulated continuous motion up to `now`.
    fn integrate_motion(state: &mut SimState) {
        if let Some((direction, since)) = state.moving {
            let dt = since.elapsed().as_secs_f64();
            let sign = match direction {
                MoveDirection::East => 1.0,
                MoveDirection::West => -1.0,
            };
            state.az_deg = (state.az_deg + sign * SIM_MOVE_RATE_DEG_S * dt).rem_euclid(360.0);
            state.moving = Some((direction, Instant::now()));
        }
    }
}

impl HardwareAdapter for SimAdapter {
    fn connect(&self) -> HwResult<bool> {
        self.lock().connected = true;
        Ok(true)
    }

    fn disconnect(&self) {
        self.lock().connected = false;
    }

    fn is_telescope_connected(&self) -> bool {
        self.lock().connected
    }

    fn is_camera_connected(&self) -> bool {
        self.lock().connected
    }

    fn list_devices(&self) -> Vec<String> {
        vec!["Sim Mount".into(), "Sim Camera".into()]
    }

    fn point_telescope(&self, ra_deg: f64, dec_deg: f64) -> HwResult<()> {
        let mut state = self.lock();
        state.ra_deg = ra_deg;
        state.dec_deg = dec_deg;
        state.slewing_until = Some(Instant::now() + self.slew_duration);
        Ok(())
    }

    fn get_telescope_direction(&self) -> HwResult<(f64, f64)> {
        let state = self.lock();
        Ok((state.ra_deg, state.dec_deg))
    }

    fn telescope_is_moving(&self) -> HwResult<bool> {
        let mut state = self.lock();
        if let Some(until) = state.slewing_until {
            if Instant::now() >= until {
                state.slewing_until = None;
            }
        }
        Ok(state.slewing_until.is_some())
    }

    fn abort_motion(&self) {
        let mut state = self.lock();
        state.slewing_until = None;
        state.moving = None;
        state.tracking = false;
    }

    fn slew_rate_deg_per_s(&self) -> f64 {
        5.0
    }

    fn take_image(&self, task_id: &str, _exposure_s: f64) -> HwResult<Vec<PathBuf>> {
        let n = {
            let mut state = self.lock();
            state.capture_count += 1;
            state.capture_count
        };
        let path = self.images_dir.join(format!("citra_task_{task_id}_{n:03}.fits"));
        crate::fits::write_minimal_fits(&path, 16, 16)
            .map_err(|err| crate::hardware::HardwareError::Device(format!("{err:#}")))?;
        Ok(vec![path])
    }

    fn set_custom_tracking_rate(&self, ra_rate: f64, dec_rate: f64) -> HwResult<()> {
        let mut state = self.lock();
        state.tracking_rate = (ra_rate, dec_rate);
        state.tracking = true;
        Ok(())
    }

    fn get_tracking_rate(&self) -> HwResult<(f64, f64)> {
        Ok(self.lock().tracking_rate)
    }

    fn stop_tracking(&self) {
        self.lock().tracking = false;
    }

    fn observation_strategy(&self) -> ObservationStrategy {
        ObservationStrategy::Manual
    }

    fn perform_observation_sequence(
        &self,
        task_id: &str,
        _satellite: &SatelliteDto,
    ) -> HwResult<Vec<PathBuf>> {
        self.take_image(task_id, 1.0)
    }

    fn mount_mode(&self) -> MountMode {
        self.lock().mode
    }

    fn azimuth(&self) -> Option<f64> {
        let mut state = self.lock();
        Self::integrate_motion(&mut state);
        Some(state.az_deg)
    }

    fn altitude(&self) -> Option<f64> {
        Some(self.lock().alt_deg)
    }

    fn cached_direction(&self) -> Option<(f64, f64)> {
        let state = self.lock();
        Some((state.ra_deg, state.dec_deg))
    }

    fn is_tracking(&self) -> bool {
        self.lock().tracking
    }

    fn start_move(&self, direction: MoveDirection, _rate: u8) -> bool {
        self.lock().moving = Some((direction, Instant::now()));
        true
    }

    fn stop_move(&self, _direction: MoveDirection) {
        let mut state = self.lock();
        Self::integrate_motion(&mut state);
        state.moving = None;
    }

    fn home_mount(&self) -> bool {
        let mut state = self.lock();
        state.homed = true;
        state.az_deg = 0.0;
        state.alt_deg = 45.0;
        true
    }

    fn is_mount_homed(&self) -> bool {
        self.lock().homed
    }

    fn sync_to_radec(&self, ra_deg: f64, dec_deg: f64) -> HwResult<()> {
        let mut state = self.lock();
        state.ra_deg = ra_deg;
        state.dec_deg = dec_deg;
        Ok(())
    }

    fn update_from_plate_solve(
        &self,
        solved_ra_deg: f64,
        solved_dec_deg: f64,
        _expected: Option<(f64, f64)>,
    ) {
        self.lock().last_plate_solve = Some((solved_ra_deg, solved_dec_deg));
    }

    fn supports_autofocus(&self) -> bool {
        true
    }

    fn do_autofocus(
        &self,
        target_ra_deg: Option<f64>,
        target_dec_deg: Option<f64>,
        on_progress: &(dyn Fn(&str) + Sync),
    ) -> HwResult<()> {
        if let (Some(ra), Some(dec)) = (target_ra_deg, target_dec_deg) {
            self.point_telescope(ra, dec)?;
        }
        on_progress("Focusing...");
        on_progress("Done");
        Ok(())
    }

    fn supports_filter_management(&self) -> bool {
        true
    }

    fn get_filter_config(&self) -> BTreeMap<String, FilterConfig> {
        self.lock().filters.clone()
    }

    fn update_filter_focus(&self, filter_id: &str, focus_position: i32) -> bool {
        let mut state = self.lock();
        match state.filters.get_mut(filter_id) {
            Some(filter) => {
                filter.focus_position = focus_position;
                true
            }
            None => false,
        }
    }

    fn update_filter_enabled(&self, filter_id: &str, enabled: bool) -> bool {
        let mut state = self.lock();
        match state.filters.get_mut(filter_id) {
            Some(filter) => {
                filter.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn select_filter_for_task(&self, _filter_name: &str) -> HwResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slew_settles_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let sim =
            SimAdapter::with_slew_duration(dir.path().to_path_buf(), Duration::from_millis(10));
        sim.point_telescope(180.0, 45.0).unwrap();
        assert!(sim.telescope_is_moving().unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!sim.telescope_is_moving().unwrap());
        assert_eq!(sim.get_telescope_direction().unwrap(), (180.0, 45.0));
    }

    #[test]
    fn capture_writes_fits() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimAdapter::new(dir.path().to_path_buf());
        let paths = sim.take_image("t1", 1.0).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].exists());
        assert!(!crate::fits::has_task_id(&paths[0]).unwrap());
    }

    #[test]
    fn continuous_motion_moves_azimuth() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimAdapter::new(dir.path().to_path_buf());
        sim.set_azimuth(10.0);
        assert!(sim.start_move(MoveDirection::West, 7));
        std::thread::sleep(Duration::from_millis(40));
        let az = sim.azimuth().unwrap();
        sim.stop_move(MoveDirection::West);
        assert!(az < 10.0 || az > 350.0, "west motion decreases azimuth, got {az}");
    }
}
