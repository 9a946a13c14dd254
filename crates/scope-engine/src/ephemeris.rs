//! Target ephemeris seam.
//!
//! The per-job driver needs "where will the satellite be in `dt` seconds"
//! and nothing more, so that is the whole contract. Real SGP4/TLE
//! propagation is an external collaborator behind [`EphemerisProvider`];
//! the simulated provider moves targets on a linear great-circle-ish track,
//! which is plenty for exercising lead-point convergence.

use citrascope_core::angles::angular_distance_deg;

use crate::api::ElsetDto;
use crate::location::SensorLocation;

/// Predicted topocentric position and apparent rates.
#[derive(Debug, Clone, Copy)]
pub struct TargetVector {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub ra_rate_arcsec_s: f64,
    pub dec_rate_arcsec_s: f64,
}

/// Evaluates a single pass target at offsets from "now".
pub trait TargetEphemeris: Send + Sync {
    fn target_at(&self, seconds_from_now: f64) -> anyhow::Result<TargetVector>;
}

/// Builds a per-job ephemeris from an elset and the observing site.
pub trait EphemerisProvider: Send + Sync {
    fn for_elset(
        &self,
        elset: &ElsetDto,
        site: &SensorLocation,
    ) -> anyhow::Result<Box<dyn TargetEphemeris>>;
}

/// Straight-line sky motion at constant rates.
#[derive(Debug, Clone, Copy)]
pub struct LinearEphemeris {
    pub ra0_deg: f64,
    pub dec0_deg: f64,
    pub ra_rate_deg_s: f64,
    pub dec_rate_deg_s: f64,
}

impl TargetEphemeris for LinearEphemeris {
    fn target_at(&self, seconds_from_now: f64) -> anyhow::Result<TargetVector> {
        Ok(TargetVector {
            ra_deg: (self.ra0_deg + self.ra_rate_deg_s * seconds_from_now).rem_euclid(360.0),
            dec_deg: (self.dec0_deg + self.dec_rate_deg_s * seconds_from_now).clamp(-90.0, 90.0),
            ra_rate_arcsec_s: self.ra_rate_deg_s * 3600.0,
            dec_rate_arcsec_s: self.dec_rate_deg_s * 3600.0,
        })
    }
}

/// Deterministic provider for `--simulate` and tests: the starting point is
/// derived from the elset text so different satellites get different (but
/// repeatable) tracks.
pub struct SimEphemerisProvider;

impl EphemerisProvider for SimEphemerisProvider {
    fn for_elset(
        &self,
        elset: &ElsetDto,
        _site: &SensorLocation,
    ) -> anyhow::Result<Box<dyn TargetEphemeris>> {
        if elset.tle.len() < 2 {
            anyhow::bail!("elset is missing TLE lines");
        }
        let seed: u32 = elset.tle[0].bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Ok(Box::new(LinearEphemeris {
            ra0_deg: (seed % 360) as f64,
            dec0_deg: ((seed / 360) % 120) as f64 - 60.0,
            ra_rate_deg_s: 0.05,
            dec_rate_deg_s: 0.01,
        }))
    }
}

/// Separation in degrees between a pointing and a target vector.
pub fn distance_to_target(pointing: (f64, f64), target: &TargetVector) -> f64 {
    angular_distance_deg(pointing.0, pointing.1, target.ra_deg, target.dec_deg)
}
