use std::path::PathBuf;

use clap::Parser;

const DEFAULT_HOST: &str = "api.citra.space";
const DEV_HOST: &str = "dev.api.citra.space";

#[derive(Debug, Clone, Parser)]
#[command(name = "citrascope", version, about = "CitraScope ground-station telescope daemon")]
pub struct Cli {
    /// Dispatch API host.
    #[arg(long, env = "CITRASCOPE_HOST")]
    pub host: Option<String>,

    /// Personal access token for the dispatch API.
    #[arg(long, env = "CITRASCOPE_PERSONAL_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Telescope record id this daemon operates as.
    #[arg(long, env = "CITRASCOPE_TELESCOPE_ID")]
    pub telescope_id: Option<String>,

    /// Use the development API endpoint.
    #[arg(long, default_value_t = false)]
    pub dev: bool,

    /// Drive simulated hardware instead of a device adapter.
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Keep capture files after a successful upload.
    #[arg(long, env = "CITRASCOPE_KEEP_IMAGES", default_value_t = false)]
    pub keep_images: bool,

    /// Capture directory (defaults to the XDG data dir).
    #[arg(long, env = "CITRASCOPE_IMAGES_DIR")]
    pub images_dir: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set (e.g. `info`,
    /// `citrascope_engine=debug`).
    #[arg(long, env = "CITRASCOPE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Host to talk to, honoring `--dev`.
    pub fn effective_host(&self) -> String {
        match (&self.host, self.dev) {
            (Some(host), _) => host.clone(),
            (None, true) => DEV_HOST.to_string(),
            (None, false) => DEFAULT_HOST.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_flag_switches_host() {
        let cli = Cli::parse_from(["citrascope", "--dev"]);
        assert_eq!(cli.effective_host(), DEV_HOST);

        let cli = Cli::parse_from(["citrascope"]);
        assert_eq!(cli.effective_host(), DEFAULT_HOST);

        let cli = Cli::parse_from(["citrascope", "--dev", "--host", "localhost:9000"]);
        assert_eq!(cli.effective_host(), "localhost:9000", "explicit host wins");
    }
}
