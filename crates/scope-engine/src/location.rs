//! Ground-station location with optional live GPS.
//!
//! Ground stations have locations; telescopes are physically at ground
//! stations. Fixed stations use the record configured on the server;
//! mobile stations carry a GPS receiver whose fixes both improve local
//! pointing and are pushed back to the server record.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::api::{CitraApi, GroundStationDto};

/// A resolved observing location.
#[derive(Debug, Clone, Serialize)]
pub struct SensorLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above the reference ellipsoid.
    pub altitude: f64,
    /// Where the numbers came from (`gps` or `ground_station`).
    pub source: &'static str,
}

/// One GPS reading.
#[derive(Debug, Clone, Copy)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// 0 = no fix, 2 = 2D, 3 = 3D.
    pub fix_mode: u8,
    pub satellites: u32,
}

impl GpsFix {
    /// A fix good enough to act on: full 3D with a healthy constellation.
    pub fn is_strong(&self) -> bool {
        self.fix_mode >= 3 && self.satellites >= 4
    }
}

/// Source of GPS fixes (gpsd bridge, serial NMEA reader, ...). External
/// collaborators implement this; `None` means no receiver is attached.
pub trait GpsSource: Send + Sync {
    fn current_fix(&self) -> Option<GpsFix>;
}

struct LocationState {
    ground_station: GroundStationDto,
    last_server_update: Option<std::time::Instant>,
}

/// Resolves the best available location and keeps the server record of a
/// mobile station current.
pub struct LocationService {
    state: Mutex<LocationState>,
    gps: Option<Box<dyn GpsSource>>,
    updates_enabled: bool,
    update_interval: Duration,
}

impl LocationService {
    pub fn new(
        ground_station: GroundStationDto,
        gps: Option<Box<dyn GpsSource>>,
        updates_enabled: bool,
        update_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(LocationState { ground_station, last_server_update: None }),
            gps,
            updates_enabled,
            update_interval,
        }
    }

    /// Best available location: a strong GPS fix when updates are enabled,
    /// otherwise the ground-station record.
    pub fn current_location(&self) -> SensorLocation {
        if self.updates_enabled {
            if let Some(gps) = &self.gps {
                if let Some(fix) = gps.current_fix() {
                    if fix.is_strong() {
                        return SensorLocation {
                            latitude: fix.latitude,
                            longitude: fix.longitude,
                            altitude: fix.altitude,
                            source: "gps",
                        };
                    }
                }
            }
        }

        let state = self.state.lock().expect("location lock");
        SensorLocation {
            latitude: state.ground_station.latitude,
            longitude: state.ground_station.longitude,
            altitude: state.ground_station.altitude,
            source: "ground_station",
        }
    }

    pub fn ground_station(&self) -> GroundStationDto {
        self.state.lock().expect("location lock").ground_station.clone()
    }

    /// Push the current GPS fix to the server record, rate-limited to the
    /// configured interval. No-op without a strong fix or with updates
    /// disabled.
    pub async fn maybe_push_gps_update(&self, api: &dyn CitraApi) {
        if !self.updates_enabled {
            return;
        }
        let Some(gps) = &self.gps else { return };
        let Some(fix) = gps.current_fix() else { return };
        if !fix.is_strong() {
            return;
        }

        let station_id = {
            let state = self.state.lock().expect("location lock");
            if let Some(at) = state.last_server_update {
                if at.elapsed() < self.update_interval {
                    return;
                }
            }
            state.ground_station.id.clone()
        };

        match api
            .update_ground_station_location(&station_id, fix.latitude, fix.longitude, fix.altitude)
            .await
        {
            Ok(()) => {
                let mut state = self.state.lock().expect("location lock");
                state.ground_station.latitude = fix.latitude;
                state.ground_station.longitude = fix.longitude;
                state.ground_station.altitude = fix.altitude;
                state.last_server_update = Some(std::time::Instant::now());
                tracing::info!(
                    lat = fix.latitude,
                    lon = fix.longitude,
                    alt = fix.altitude,
                    "updated ground station location from GPS"
                );
            }
            Err(err) => {
                tracing::warn!("ground station location update failed: {err:#}");
            }
        }
    }
}
