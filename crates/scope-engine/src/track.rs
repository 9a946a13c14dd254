//! Per-job telescope task driver.
//!
//! Drives one capture end to end: pick the freshest elset, converge on a
//! lead position that accounts for slew time, match the satellite's
//! apparent rates, expose, and hand the files back. Runs on a blocking
//! thread (device I/O and waits); the imaging stage owns the async side.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use citrascope_core::angles::angular_distance_deg;
use citrascope_core::task::Task;

use crate::api::SatelliteDto;
use crate::ephemeris::TargetEphemeris;
use crate::hardware::{HardwareAdapter, ObservationStrategy};
use crate::queue::FatalWorkError;

/// Accept the pointing once within this distance of the live target.
const MAX_ANGULAR_DISTANCE_DEG: f64 = 0.3;
/// Outer lead-point attempts before capturing with whatever pointing we
/// have.
const MAX_LEAD_ATTEMPTS: u32 = 10;
/// Inner fixed-point iterations of the slew-time estimator.
const MAX_ESTIMATE_ITERATIONS: u32 = 5;
/// The estimator has converged when the predicted slew time stops moving
/// by more than this.
const ESTIMATE_TOLERANCE_S: f64 = 0.1;

const DEFAULT_SLEW_POLL: Duration = Duration::from_millis(100);
const DEFAULT_SLEW_TIMEOUT: Duration = Duration::from_secs(300);

/// One tracked observation job. Blocking; construct and call
/// [`TrackingJob::run`] from `spawn_blocking`.
pub struct TrackingJob {
    pub task: Arc<Task>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub ephemeris: Box<dyn TargetEphemeris>,
    pub satellite: SatelliteDto,
    pub exposure_s: f64,
    /// Checked at loop boundaries; raising ends the job without retry.
    pub cancel: Arc<AtomicBool>,
    pub slew_poll: Duration,
    pub slew_timeout: Duration,
}

impl TrackingJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Arc<Task>,
        adapter: Arc<dyn HardwareAdapter>,
        ephemeris: Box<dyn TargetEphemeris>,
        satellite: SatelliteDto,
        exposure_s: f64,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task,
            adapter,
            ephemeris,
            satellite,
            exposure_s,
            cancel,
            slew_poll: DEFAULT_SLEW_POLL,
            slew_timeout: DEFAULT_SLEW_TIMEOUT,
        }
    }

    fn check_cancel(&self) -> anyhow::Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(FatalWorkError("observation cancelled".to_string()).into())
        } else {
            Ok(())
        }
    }

    /// Predicted seconds to slew from the current pointing to the target's
    /// position `seconds_from_now` ahead.
    fn predict_slew_time_s(&self, seconds_from_now: f64) -> anyhow::Result<f64> {
        let (scope_ra, scope_dec) = self
            .adapter
            .get_telescope_direction()
            .map_err(|err| anyhow::anyhow!("read pointing: {err}"))?;
        let target = self.ephemeris.target_at(seconds_from_now)?;
        let distance = angular_distance_deg(scope_ra, scope_dec, target.ra_deg, target.dec_deg);
        let rate = self.adapter.slew_rate_deg_per_s().max(0.1);
        Ok(distance / rate)
    }

    /// Fixed-point estimate of where the satellite will be when the slew
    /// finishes.
    fn estimate_lead_position(&self) -> anyhow::Result<(f64, f64, f64)> {
        let mut est_slew_s = self.predict_slew_time_s(0.0)?;
        for _ in 0..MAX_ESTIMATE_ITERATIONS {
            let new_est = self.predict_slew_time_s(est_slew_s)?;
            if (new_est - est_slew_s).abs() < ESTIMATE_TOLERANCE_S {
                est_slew_s = new_est;
                break;
            }
            est_slew_s = new_est;
        }
        let lead = self.ephemeris.target_at(est_slew_s)?;
        Ok((lead.ra_deg, lead.dec_deg, est_slew_s))
    }

    fn wait_slew_done(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.slew_timeout;
        loop {
            // A cancellation arriving mid-slew must not wait out the whole
            // motion; stop the mount and unwind now.
            if self.cancel.load(Ordering::SeqCst) {
                self.adapter.abort_motion();
                return Err(FatalWorkError("observation cancelled".to_string()).into());
            }
            let moving = self
                .adapter
                .telescope_is_moving()
                .map_err(|err| anyhow::anyhow!("poll slew state: {err}"))?;
            if !moving {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.adapter.abort_motion();
                anyhow::bail!(
                    "slew did not settle within {:.0}s, aborted",
                    self.slew_timeout.as_secs_f64()
                );
            }
            std::thread::sleep(self.slew_poll);
        }
    }

    /// Converge onto the target, then expose. Returns the capture paths.
    pub fn run(&self) -> anyhow::Result<Vec<PathBuf>> {
        // Sequence-owning adapters get the whole job.
        if self.adapter.observation_strategy() == ObservationStrategy::SequenceToController {
            self.check_cancel()?;
            self.task.set_status_msg("Running controller sequence...");
            return self
                .adapter
                .perform_observation_sequence(&self.task.id, &self.satellite)
                .map_err(|err| anyhow::anyhow!("observation sequence failed: {err}"));
        }

        if let Some(filter) = &self.task.assigned_filter_name {
            if self.adapter.supports_filter_management() {
                self.adapter
                    .select_filter_for_task(filter)
                    .map_err(|err| anyhow::anyhow!("filter selection failed: {err}"))?;
            }
        }

        let mut attempts = 0u32;
        while attempts < MAX_LEAD_ATTEMPTS {
            attempts += 1;
            self.check_cancel()?;

            let (lead_ra, lead_dec, est_slew_s) = self.estimate_lead_position()?;
            tracing::info!(
                task_id = self.task.id,
                lead_ra,
                lead_dec,
                est_slew_s,
                attempt = attempts,
                "pointing ahead of target"
            );
            self.task.set_status_msg("Slewing to lead position...");
            self.task.set_last_target(lead_ra, lead_dec);

            let slew_started = Instant::now();
            self.adapter
                .point_telescope(lead_ra, lead_dec)
                .map_err(|err| anyhow::anyhow!("slew refused: {err}"))?;
            self.wait_slew_done()?;
            tracing::debug!(
                task_id = self.task.id,
                slew_s = slew_started.elapsed().as_secs_f64(),
                "slew settled"
            );

            self.check_cancel()?;
            let (scope_ra, scope_dec) = self
                .adapter
                .get_telescope_direction()
                .map_err(|err| anyhow::anyhow!("read pointing: {err}"))?;
            let now_target = self.ephemeris.target_at(0.0)?;
            let distance =
                angular_distance_deg(scope_ra, scope_dec, now_target.ra_deg, now_target.dec_deg);
            tracing::info!(task_id = self.task.id, distance_deg = distance, "distance to target");
            if distance <= MAX_ANGULAR_DISTANCE_DEG {
                break;
            }
            if attempts == MAX_LEAD_ATTEMPTS {
                tracing::warn!(
                    task_id = self.task.id,
                    "lead-point attempts exhausted, capturing with current pointing"
                );
            }
        }

        // Match the satellite's apparent motion during the exposure.
        let rates = self.ephemeris.target_at(0.0)?;
        if let Err(err) = self
            .adapter
            .set_custom_tracking_rate(rates.ra_rate_arcsec_s, rates.dec_rate_arcsec_s)
        {
            tracing::warn!(task_id = self.task.id, "custom tracking rate refused: {err}");
        }

        self.check_cancel()?;
        self.task.set_status_msg("Capturing...");
        let paths = self
            .adapter
            .take_image(&self.task.id, self.exposure_s)
            .map_err(|err| anyhow::anyhow!("capture failed: {err}"))
            .context("take_image")?;
        if paths.is_empty() {
            anyhow::bail!("camera returned no capture files");
        }
        Ok(paths)
    }
}

/// Pick the freshest elset or explain why the job can't run.
pub fn select_elset(satellite: &SatelliteDto) -> anyhow::Result<crate::api::ElsetDto> {
    satellite
        .most_recent_elset()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("satellite {} has no elsets", satellite.id))
}
