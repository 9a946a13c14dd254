//! Hardware adapter contract.
//!
//! The pipeline talks to physical devices exclusively through
//! [`HardwareAdapter`]; concrete device-protocol drivers (mount serial
//! grammars, camera SDKs, third-party orchestrators) live outside this
//! crate and implement the trait. The adapter exclusively owns its device
//! handles; nothing else touches device state directly.

pub mod sim;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::api::SatelliteDto;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("{0} is not supported by this adapter")]
    NotSupported(&'static str),
    #[error("device refused: {0}")]
    Refused(String),
    #[error("device error: {0}")]
    Device(String),
}

pub type HwResult<T> = Result<T, HardwareError>;

/// Who owns the slew-capture sequence for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationStrategy {
    /// The pipeline points the mount and triggers the capture itself.
    Manual,
    /// The adapter runs the full sequence when handed a task
    /// ([`HardwareAdapter::perform_observation_sequence`]).
    SequenceToController,
}

/// Mount geometry. Only alt-az mounts accumulate cable wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    AltAz,
    Equatorial,
    Unknown,
}

/// Direction for continuous azimuth motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    East,
    West,
}

/// One filter slot: name, focuser position, and whether observations may
/// select it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    pub focus_position: i32,
    pub enabled: bool,
}

/// Capability surface the pipeline consumes.
///
/// Calls may block on device I/O (serial, SDK); async callers bridge in
/// with `spawn_blocking`. Methods for optional capabilities have inert
/// defaults and are advertised through the `supports_*` queries.
pub trait HardwareAdapter: Send + Sync {
    // Lifecycle -----------------------------------------------------------

    fn connect(&self) -> HwResult<bool>;
    fn disconnect(&self);
    fn is_telescope_connected(&self) -> bool;
    fn is_camera_connected(&self) -> bool;
    fn list_devices(&self) -> Vec<String>;

    // Pointing ------------------------------------------------------------

    /// Initiate a slew to RA/Dec (degrees). Completion is observed via
    /// [`HardwareAdapter::telescope_is_moving`].
    fn point_telescope(&self, ra_deg: f64, dec_deg: f64) -> HwResult<()>;
    /// Current pointing (RA degrees, Dec degrees).
    fn get_telescope_direction(&self) -> HwResult<(f64, f64)>;
    fn telescope_is_moving(&self) -> HwResult<bool>;
    /// Halt all mount motion immediately. Must be safe to call from the
    /// safety watchdog at any moment.
    fn abort_motion(&self);

    /// Maximum slew speed, degrees per second. Used for lead-time
    /// prediction.
    fn slew_rate_deg_per_s(&self) -> f64;

    // Capture -------------------------------------------------------------

    /// Expose and save one or more frames; returns the capture paths.
    fn take_image(&self, task_id: &str, exposure_s: f64) -> HwResult<Vec<PathBuf>>;

    // Tracking ------------------------------------------------------------

    /// Tracking rate offsets in arcseconds/second (RA, Dec).
    fn set_custom_tracking_rate(&self, ra_rate: f64, dec_rate: f64) -> HwResult<()>;
    fn get_tracking_rate(&self) -> HwResult<(f64, f64)>;
    fn stop_tracking(&self);

    // Observation strategy ------------------------------------------------

    fn observation_strategy(&self) -> ObservationStrategy {
        ObservationStrategy::Manual
    }

    /// For `SequenceToController` adapters: run the whole slew-capture
    /// sequence for a task and return the capture paths.
    fn perform_observation_sequence(
        &self,
        _task_id: &str,
        _satellite: &SatelliteDto,
    ) -> HwResult<Vec<PathBuf>> {
        Err(HardwareError::NotSupported("observation sequence"))
    }

    // Mount state for safety checks and status readers --------------------
    //
    // These read the adapter's cached snapshot where one exists; they must
    // not block concurrent readers on serial I/O.

    fn mount_mode(&self) -> MountMode {
        MountMode::Unknown
    }
    /// Current azimuth in degrees, for mounts that report one.
    fn azimuth(&self) -> Option<f64> {
        None
    }
    /// Current altitude in degrees, for mounts that report one.
    fn altitude(&self) -> Option<f64> {
        None
    }
    /// Cached RA/Dec for status readers; `None` when unknown.
    fn cached_direction(&self) -> Option<(f64, f64)> {
        None
    }
    fn is_tracking(&self) -> bool {
        false
    }
    fn is_parked(&self) -> bool {
        false
    }

    /// Begin continuous motion in one azimuth direction at a mount-defined
    /// rate index. Returns false when unsupported.
    fn start_move(&self, _direction: MoveDirection, _rate: u8) -> bool {
        false
    }
    fn stop_move(&self, _direction: MoveDirection) {}

    // Homing / alignment --------------------------------------------------

    /// Initiate the mount's find-home routine. Returns false when
    /// unsupported or refused.
    fn home_mount(&self) -> bool {
        false
    }
    fn is_mount_homed(&self) -> bool {
        false
    }
    /// Tell the mount it is currently pointing at RA/Dec (degrees) without
    /// moving.
    fn sync_to_radec(&self, _ra_deg: f64, _dec_deg: f64) -> HwResult<()> {
        Err(HardwareError::NotSupported("sync"))
    }

    /// Feed a plate-solve result back so the pointing model can learn its
    /// error. `expected` is the commanded position the solve should have
    /// matched.
    fn update_from_plate_solve(
        &self,
        _solved_ra_deg: f64,
        _solved_dec_deg: f64,
        _expected: Option<(f64, f64)>,
    ) {
    }

    // Optional capabilities -----------------------------------------------

    fn supports_autofocus(&self) -> bool {
        false
    }
    /// Run the autofocus routine, reporting human-readable progress.
    fn do_autofocus(
        &self,
        _target_ra_deg: Option<f64>,
        _target_dec_deg: Option<f64>,
        _on_progress: &(dyn Fn(&str) + Sync),
    ) -> HwResult<()> {
        Err(HardwareError::NotSupported("autofocus"))
    }

    /// Direct camera parameter control (gain, offset, binning) beyond
    /// plain captures.
    fn supports_camera_control(&self) -> bool {
        false
    }

    fn supports_filter_management(&self) -> bool {
        false
    }
    /// Filter slots keyed by wheel position.
    fn get_filter_config(&self) -> BTreeMap<String, FilterConfig> {
        BTreeMap::new()
    }
    fn update_filter_focus(&self, _filter_id: &str, _focus_position: i32) -> bool {
        false
    }
    fn update_filter_enabled(&self, _filter_id: &str, _enabled: bool) -> bool {
        false
    }
    /// Move the wheel (and focuser) to the filter assigned to a task.
    fn select_filter_for_task(&self, _filter_name: &str) -> HwResult<()> {
        Ok(())
    }
}
