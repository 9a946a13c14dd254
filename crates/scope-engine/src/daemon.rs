//! Daemon assembly and run loop.
//!
//! Validates the server session, connects hardware, builds the safety
//! monitor, the three stage queues, the scheduler, and the routine
//! managers, then runs the stage-event loop until asked to stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use citrascope_core::settings::SettingsStore;

use crate::api::{CitraApi, GroundStationDto, TelescopeDto};
use crate::ephemeris::EphemerisProvider;
use crate::hardware::snapshot::MountStatusCache;
use crate::hardware::{HardwareAdapter, MountMode};
use crate::location::{GpsSource, LocationService};
use crate::managers::{
    AlignmentManager, AutofocusManager, HomingManager, PlateSolver, RoutineGate,
};
use crate::pipeline::{PipelineDeps, StageEventRx, handle_stage_event, stage_event_channel};
use crate::processors::ProcessorRegistry;
use crate::queue::{RetryPolicy, WorkQueue};
use crate::safety::{
    CableWrapCheck, DiskSpaceCheck, OperatorStopCheck, SafetyCheck, SafetyMonitor, TimeHealthCheck,
};
use crate::scheduler::{RunnerDeps, Scheduler, spawn_poller, spawn_runner};
use crate::stages::imaging::{ImagingItem, ImagingStage};
use crate::stages::processing::ProcessingStage;
use crate::stages::upload::UploadStage;
use crate::timesync::{TimeMonitor, TimeSource};

/// External collaborators injected at startup.
pub struct DaemonDeps {
    pub settings: Arc<SettingsStore>,
    pub api: Arc<dyn CitraApi>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub ephemeris: Arc<dyn EphemerisProvider>,
    pub solver: Arc<dyn PlateSolver>,
    pub registry: Arc<ProcessorRegistry>,
    pub gps: Option<Box<dyn GpsSource>>,
    pub time_source: Box<dyn TimeSource>,
}

/// Cadences, overridable for tests.
#[derive(Debug, Clone)]
pub struct DaemonTuning {
    pub poll_interval: Duration,
    pub runner_interval: Duration,
    pub heartbeat_interval: Duration,
    pub mount_poll_interval: Duration,
    pub cable_wrap_state: Option<std::path::PathBuf>,
}

impl Default for DaemonTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            runner_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            mount_poll_interval: Duration::from_millis(500),
            cable_wrap_state: None,
        }
    }
}

/// A built (not yet running) daemon.
pub struct Daemon {
    api: Arc<dyn CitraApi>,
    adapter: Arc<dyn HardwareAdapter>,
    tuning: DaemonTuning,
    telescope: TelescopeDto,
    ground_station: GroundStationDto,

    scheduler: Arc<Scheduler>,
    monitor: Arc<SafetyMonitor>,
    operator_stop: Arc<OperatorStopCheck>,
    location: Arc<LocationService>,
    time_monitor: Arc<TimeMonitor>,

    imaging_queue: WorkQueue<ImagingStage>,
    processing_queue: WorkQueue<ProcessingStage>,
    upload_queue: WorkQueue<UploadStage>,
    events_rx: StageEventRx,
    pipeline: PipelineDeps,
    managers: Vec<Arc<dyn RoutineGate>>,
}

/// Control surface for a running daemon.
pub struct DaemonHandle {
    stopper: DaemonStopper,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<SafetyMonitor>,
    pub operator_stop: Arc<OperatorStopCheck>,
}

/// Detachable stop trigger, so callers can keep requesting shutdown while
/// something else awaits [`DaemonHandle::wait`].
#[derive(Clone)]
pub struct DaemonStopper {
    stop: Arc<tokio::sync::Notify>,
    stopped: Arc<AtomicBool>,
}

impl DaemonStopper {
    /// Request a graceful shutdown: finish in-flight work, stop queues.
    pub fn request_stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so the run loop sees the request
            // even if it wasn't parked on the notify yet.
            self.stop.notify_one();
        }
    }
}

impl DaemonHandle {
    pub fn stopper(&self) -> DaemonStopper {
        self.stopper.clone()
    }

    /// Request a graceful shutdown: finish in-flight work, stop queues.
    pub fn request_stop(&self) {
        self.stopper.request_stop();
    }

    /// Wait for the daemon to stop.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("daemon task join error: {err:#}")),
        }
    }
}

impl Daemon {
    /// Validate the session, connect hardware, and wire every component.
    pub async fn build(deps: DaemonDeps, tuning: DaemonTuning) -> anyhow::Result<Self> {
        let DaemonDeps { settings, api, adapter, ephemeris, solver, registry, gps, time_source } =
            deps;
        let snapshot = settings.snapshot();

        if !api.check_token().await {
            anyhow::bail!("could not authenticate with the dispatch API");
        }
        let telescope = api
            .telescope(&snapshot.telescope_id)
            .await
            .map_err(|err| anyhow::anyhow!("telescope_id is not valid on the server: {err:#}"))?;
        let ground_station = api
            .ground_station(&telescope.ground_station_id)
            .await
            .map_err(|err| anyhow::anyhow!("could not fetch ground station: {err:#}"))?;
        tracing::info!(
            telescope = telescope.name,
            ground_station = ground_station.name,
            "validated server records"
        );

        {
            let adapter = adapter.clone();
            let connected = tokio::task::spawn_blocking(move || adapter.connect()).await?;
            if !connected.map_err(|err| anyhow::anyhow!("hardware connect failed: {err}"))? {
                anyhow::bail!("hardware adapter refused to connect");
            }
        }
        tracing::info!(devices = ?adapter.list_devices(), "hardware connected");

        let location = Arc::new(LocationService::new(
            ground_station.clone(),
            gps,
            snapshot.gps_location_updates_enabled,
            Duration::from_secs(snapshot.gps_update_interval_minutes * 60),
        ));

        let time_monitor = Arc::new(TimeMonitor::new(
            time_source,
            snapshot.time_pause_threshold_ms,
            Duration::from_secs(snapshot.time_check_interval_minutes * 60),
        ));

        // Safety stack. Cable wrap only matters on alt-az mounts.
        let images_dir = snapshot.images_dir()?;
        std::fs::create_dir_all(&images_dir)?;
        let operator_stop = Arc::new(OperatorStopCheck::new());
        let mut checks: Vec<Arc<dyn SafetyCheck>> = vec![
            operator_stop.clone(),
            Arc::new(DiskSpaceCheck::new(images_dir)),
            Arc::new(TimeHealthCheck::new(time_monitor.clone())),
        ];
        if adapter.mount_mode() == MountMode::AltAz {
            let state_path = match &tuning.cable_wrap_state {
                Some(path) => Some(path.clone()),
                None => citrascope_core::settings::Settings::cable_wrap_state_path().ok(),
            };
            checks.push(Arc::new(CableWrapCheck::new(adapter.clone(), state_path)));
        }
        let abort_adapter = adapter.clone();
        let monitor = Arc::new(SafetyMonitor::new(
            checks,
            Some(Box::new(move || abort_adapter.abort_motion())),
        ));

        let scheduler = Arc::new(Scheduler::new(telescope.automated_scheduling));
        let (events_tx, events_rx) = stage_event_channel();
        let policy = RetryPolicy::from_settings(&snapshot);

        let upload_queue = WorkQueue::start(
            UploadStage {
                api: api.clone(),
                settings: settings.clone(),
                telescope: telescope.clone(),
                events: events_tx.clone(),
            },
            snapshot.upload_workers,
            policy.clone(),
        );

        let processing_queue = WorkQueue::start(
            ProcessingStage {
                registry,
                settings: settings.clone(),
                telescope: telescope.clone(),
                ground_station: ground_station.clone(),
                location: location.clone(),
                events: events_tx.clone(),
            },
            snapshot.processing_workers,
            policy.clone(),
        );

        // Exactly one imaging worker: the mount is single-tenant.
        let imaging_queue = WorkQueue::start(
            ImagingStage {
                api: api.clone(),
                adapter: adapter.clone(),
                ephemeris,
                location: location.clone(),
                settings: settings.clone(),
                scheduler: scheduler.clone(),
                processing: processing_queue.handle(),
                upload: upload_queue.handle(),
                events: events_tx.clone(),
                // The operator-stop latch doubles as the per-job
                // cancellation flag, so activation reaches an in-flight
                // job at its next loop boundary.
                cancel: operator_stop.latch(),
            },
            1,
            policy,
        );

        let idle_probe = || {
            let handle = imaging_queue.handle();
            Box::new(move || handle.is_idle()) as Box<dyn Fn() -> bool + Send + Sync>
        };
        let autofocus =
            Arc::new(AutofocusManager::new(adapter.clone(), settings.clone(), idle_probe()));
        let alignment = Arc::new(AlignmentManager::new(
            adapter.clone(),
            solver,
            telescope.clone(),
            settings.clone(),
            idle_probe(),
        ));
        let homing = Arc::new(HomingManager::new(adapter.clone(), idle_probe()));
        let managers: Vec<Arc<dyn RoutineGate>> = vec![autofocus, alignment, homing];

        let pipeline = PipelineDeps {
            scheduler: scheduler.clone(),
            api: api.clone(),
            adapter: adapter.clone(),
            location: location.clone(),
            upload: upload_queue.handle(),
        };

        Ok(Self {
            api,
            adapter,
            tuning,
            telescope,
            ground_station,
            scheduler,
            monitor,
            operator_stop,
            location,
            time_monitor,
            imaging_queue,
            processing_queue,
            upload_queue,
            events_rx,
            pipeline,
            managers,
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Spawn the poller, runner, watchdog, and event loop.
    pub fn start(self) -> DaemonHandle {
        let stopper = DaemonStopper {
            stop: Arc::new(tokio::sync::Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let scheduler = self.scheduler.clone();
        let monitor = self.monitor.clone();
        let operator_stop = self.operator_stop.clone();

        let stop_task = stopper.stop.clone();
        let stopped_task = stopper.stopped.clone();
        let join = tokio::spawn(async move { self.run(stop_task, stopped_task).await });

        DaemonHandle { stopper, join, scheduler, monitor, operator_stop }
    }

    async fn run(
        mut self,
        stop: Arc<tokio::sync::Notify>,
        stopped: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let time_task = self.time_monitor.start();
        self.monitor.start_watchdog();
        let mount_cache =
            MountStatusCache::start(self.adapter.clone(), self.tuning.mount_poll_interval);

        let poller = spawn_poller(
            self.scheduler.clone(),
            self.api.clone(),
            self.telescope.id.clone(),
            self.tuning.poll_interval,
        );

        let dispatch_handle = self.imaging_queue.handle();
        let idle_handle = self.imaging_queue.handle();
        let runner = spawn_runner(
            RunnerDeps {
                scheduler: self.scheduler.clone(),
                api: self.api.clone(),
                monitor: self.monitor.clone(),
                managers: self.managers.clone(),
                dispatch: Box::new(move |task| {
                    dispatch_handle.submit(task.id.clone(), ImagingItem { task });
                }),
                imaging_idle: Box::new(move || idle_handle.is_idle()),
            },
            self.tuning.runner_interval,
        );

        tracing::info!(
            telescope = self.telescope.name,
            ground_station = self.ground_station.name,
            "daemon running"
        );

        let mut heartbeat = tokio::time::interval(self.tuning.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                event_opt = self.events_rx.recv() => {
                    match event_opt {
                        Some(event) => handle_stage_event(&self.pipeline, event).await,
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    let body = serde_json::json!({ "id": self.telescope.id });
                    if let Err(err) = self.api.put_telescope_status(&body).await {
                        tracing::warn!("online heartbeat failed: {err:#}");
                    }
                    self.location.maybe_push_gps_update(self.api.as_ref()).await;
                }
            }
            if stopped.load(Ordering::SeqCst) {
                break;
            }
        }

        tracing::info!("daemon shutting down");
        poller.abort();
        runner.abort();
        self.imaging_queue.stop().await;
        self.processing_queue.stop().await;
        self.upload_queue.stop().await;
        self.monitor.stop_watchdog().await;
        mount_cache.stop().await;
        time_task.abort();
        self.adapter.disconnect();
        tracing::info!("daemon stopped");
        Ok(())
    }
}
