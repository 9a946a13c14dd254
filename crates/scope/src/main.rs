mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use citrascope_core::settings::{Settings, SettingsStore, load_settings, settings_path};
use citrascope_engine::api::CitraClient;
use citrascope_engine::daemon::{Daemon, DaemonDeps, DaemonTuning};
use citrascope_engine::ephemeris::SimEphemerisProvider;
use citrascope_engine::hardware::sim::SimAdapter;
use citrascope_engine::managers::UnconfiguredSolver;
use citrascope_engine::processors::ProcessorRegistry;
use citrascope_engine::timesync::{ChronyTimeSource, NoTimeSource, TimeSource};

use crate::cli::Cli;

fn load_effective_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match load_settings() {
        Ok(Some(settings)) => settings,
        Ok(None) => Settings::default(),
        Err(err) => {
            tracing::warn!("failed to read settings file, using defaults: {err:#}");
            Settings::default()
        }
    };

    settings.host = cli.effective_host();
    if let Some(token) = &cli.token {
        settings.personal_access_token = token.clone();
    }
    if let Some(telescope_id) = &cli.telescope_id {
        settings.telescope_id = telescope_id.clone();
    }
    if let Some(images_dir) = &cli.images_dir {
        settings.images_dir = Some(images_dir.clone());
    }
    if cli.keep_images {
        settings.keep_images = true;
    }

    if settings.personal_access_token.is_empty() {
        anyhow::bail!(
            "no access token configured (set CITRASCOPE_PERSONAL_ACCESS_TOKEN or --token)"
        );
    }
    if settings.telescope_id.is_empty() {
        anyhow::bail!("no telescope id configured (set CITRASCOPE_TELESCOPE_ID or --telescope-id)");
    }
    Ok(settings)
}

/// Resolves on Ctrl+C. If no signal handler can be installed, parks forever
/// so the daemon keeps running instead of being shut down by the error.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl+C: {err}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let settings = load_effective_settings(&cli)?;
    tracing::info!(host = settings.host, telescope_id = settings.telescope_id, "starting up");

    let adapter_name =
        settings.hardware_adapter.clone().unwrap_or_else(|| "sim".to_string());
    let adapter: Arc<dyn citrascope_engine::hardware::HardwareAdapter> =
        if cli.simulate || adapter_name == "sim" {
            tracing::info!("driving simulated hardware");
            Arc::new(SimAdapter::new(settings.images_dir()?))
        } else {
            // Device-protocol adapters (serial mounts, camera SDKs,
            // third-party orchestrators) ship as separate crates and
            // register here.
            anyhow::bail!("no {adapter_name:?} hardware adapter is built into this binary");
        };

    let api = Arc::new(CitraClient::new(settings.api_base_url(), &settings.personal_access_token)?);

    let time_source: Box<dyn TimeSource> = if ChronyTimeSource::is_available() {
        Box::new(ChronyTimeSource)
    } else {
        tracing::warn!("chrony not reachable, clock health will be unknown");
        Box::new(NoTimeSource)
    };

    let store = Arc::new(SettingsStore::new(settings, settings_path().ok()));
    let daemon = Daemon::build(
        DaemonDeps {
            settings: store,
            api,
            adapter,
            ephemeris: Arc::new(SimEphemerisProvider),
            solver: Arc::new(UnconfiguredSolver),
            registry: Arc::new(ProcessorRegistry::standard()),
            gps: None,
            time_source,
        },
        DaemonTuning::default(),
    )
    .await?;

    let handle = daemon.start();
    let stopper = handle.stopper();
    let mut wait = std::pin::pin!(handle.wait());
    tracing::info!("daemon started (press Ctrl+C to exit)");

    // First Ctrl+C asks the daemon's stop path for a graceful shutdown;
    // until then the daemon may also exit on its own.
    tokio::select! {
        res = &mut wait => return res,
        _ = ctrl_c() => {
            eprintln!(
                "Stop requested, finishing in-flight work (press CTRL+C again to exit immediately)."
            );
            stopper.request_stop();
        }
    }

    // Second Ctrl+C during the drain forces an immediate exit.
    tokio::select! {
        res = &mut wait => res,
        _ = ctrl_c() => {
            eprintln!("Stop requested again, exiting immediately.");
            std::process::exit(130);
        }
    }
}
