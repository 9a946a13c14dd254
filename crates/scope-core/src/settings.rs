//! Daemon settings persisted as JSON under the XDG config directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "api.citra.space".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_task_retries() -> u32 {
    3
}

fn default_initial_retry_delay_s() -> f64 {
    30.0
}

fn default_max_retry_delay_s() -> f64 {
    300.0
}

fn default_workers() -> usize {
    1
}

fn default_time_pause_threshold_ms() -> f64 {
    500.0
}

fn default_time_check_interval_minutes() -> u64 {
    5
}

fn default_autofocus_interval_minutes() -> u64 {
    720
}

fn default_exposure_s() -> f64 {
    1.0
}

fn default_alignment_exposure_s() -> f64 {
    2.0
}

fn default_gps_update_interval_minutes() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Dispatch API hostname.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    /// Bearer token for the dispatch API.
    #[serde(default)]
    pub personal_access_token: String,
    /// Telescope record id this daemon operates as.
    #[serde(default)]
    pub telescope_id: String,

    /// Hardware adapter to drive (`sim` is built in; device-protocol
    /// adapters register under their own names).
    #[serde(default)]
    pub hardware_adapter: Option<String>,

    /// Capture directory. Defaults to the XDG data dir when unset.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
    /// Keep capture files after a successful upload.
    #[serde(default)]
    pub keep_images: bool,

    /// Adapter-specific persisted state (filter tables, focus offsets),
    /// keyed by concern. Opaque to the core.
    #[serde(default)]
    pub adapter_settings: BTreeMap<String, serde_json::Value>,

    /// Master switch for the processor chain.
    #[serde(default = "default_true")]
    pub processors_enabled: bool,
    /// Per-processor enablement; processors missing from the map run.
    #[serde(default)]
    pub enabled_processors: BTreeMap<String, bool>,

    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    #[serde(default = "default_initial_retry_delay_s")]
    pub initial_retry_delay_s: f64,
    #[serde(default = "default_max_retry_delay_s")]
    pub max_retry_delay_s: f64,

    #[serde(default = "default_workers")]
    pub processing_workers: usize,
    #[serde(default = "default_workers")]
    pub upload_workers: usize,

    /// Clock offset (ms) at which task processing pauses.
    #[serde(default = "default_time_pause_threshold_ms")]
    pub time_pause_threshold_ms: f64,
    #[serde(default = "default_time_check_interval_minutes")]
    pub time_check_interval_minutes: u64,

    /// Capture exposure length in seconds.
    #[serde(default = "default_exposure_s")]
    pub exposure_s: f64,

    #[serde(default)]
    pub scheduled_autofocus_enabled: bool,
    #[serde(default = "default_autofocus_interval_minutes")]
    pub autofocus_interval_minutes: u64,
    #[serde(default)]
    pub last_autofocus_timestamp: Option<i64>,
    /// Named preset, or `custom` together with the custom RA/Dec fields.
    #[serde(default)]
    pub autofocus_target_preset: Option<String>,
    #[serde(default)]
    pub autofocus_target_custom_ra: Option<f64>,
    #[serde(default)]
    pub autofocus_target_custom_dec: Option<f64>,

    #[serde(default = "default_alignment_exposure_s")]
    pub alignment_exposure_s: f64,
    #[serde(default)]
    pub last_alignment_timestamp: Option<i64>,

    /// Push GPS fixes to the ground-station record (mobile stations).
    #[serde(default)]
    pub gps_location_updates_enabled: bool,
    #[serde(default = "default_gps_update_interval_minutes")]
    pub gps_update_interval_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl Settings {
    fn normalize(&mut self) {
        self.personal_access_token = self.personal_access_token.trim().to_string();
        self.telescope_id = self.telescope_id.trim().to_string();
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = default_host();
        }
        if self.processing_workers == 0 {
            self.processing_workers = 1;
        }
        if self.upload_workers == 0 {
            self.upload_workers = 1;
        }
    }

    /// Base URL for the dispatch API.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    /// Capture directory, falling back to the XDG data dir.
    pub fn images_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.images_dir {
            return Ok(dir.clone());
        }
        Ok(xdg_data_home()?.join("citrascope").join("images"))
    }

    /// Per-task scratch root, a sibling of the images directory.
    pub fn processing_dir(&self) -> anyhow::Result<PathBuf> {
        let images = self.images_dir()?;
        let parent = images
            .parent()
            .ok_or_else(|| anyhow::anyhow!("images dir has no parent: {}", images.display()))?;
        Ok(parent.join("processing"))
    }

    /// Location of the persisted cable-wrap state.
    pub fn cable_wrap_state_path() -> anyhow::Result<PathBuf> {
        Ok(config_dir()?.join("cable_wrap.json"))
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

fn xdg_data_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_DATA_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("share"))
}

fn config_dir() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("citrascope"))
}

/// Path of the settings file.
pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load settings from disk; `Ok(None)` when no file exists yet.
pub fn load_settings() -> anyhow::Result<Option<Settings>> {
    let path = settings_path()?;
    load_settings_from(&path)
}

pub fn load_settings_from(path: &std::path::Path) -> anyhow::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

/// Persist settings atomically (write-tmp-then-rename).
pub fn save_settings(settings: &Settings) -> anyhow::Result<()> {
    let path = settings_path()?;
    save_settings_to(settings, &path)
}

pub fn save_settings_to(settings: &Settings, path: &std::path::Path) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Shared, mutable settings with write-through persistence.
///
/// Components that change settings at runtime (autofocus timestamps,
/// processor toggles) go through [`SettingsStore::update`], which persists
/// when a backing path is configured.
pub struct SettingsStore {
    path: Option<PathBuf>,
    inner: std::sync::Mutex<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Self {
        Self { path, inner: std::sync::Mutex::new(settings) }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.lock().expect("settings lock").clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut settings = self.inner.lock().expect("settings lock");
            apply(&mut settings);
            settings.clone()
        };
        if let Some(path) = &self.path {
            if let Err(err) = save_settings_to(&snapshot, path) {
                eprintln!("warning: failed to persist settings: {err:#}");
            }
        }
    }
}
