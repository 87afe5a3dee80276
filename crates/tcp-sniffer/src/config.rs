use serde::Deserialize;
use std::path::{Path, PathBuf};
use tcp_relay::DialFailurePolicy;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_upstream")]
    pub upstream_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            upstream_addr: default_upstream(),
        }
    }
}

/// How captured frames are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Tagged `>>>>>> id` / `<<<<<< id` text dump.
    #[default]
    Raw,
    /// One JSON object per frame.
    Json,
}

#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub suppress_headers: bool,
    #[serde(default)]
    pub format: CaptureFormat,
    /// Capture destination; `-` means stdout.
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

impl CaptureConfig {
    pub fn to_stdout(&self) -> bool {
        self.output.as_os_str() == "-"
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            suppress_headers: false,
            format: CaptureFormat::default(),
            output: default_output(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub on_dial_error: DialFailurePolicy,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_output() -> PathBuf {
    PathBuf::from("-")
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file, or `None` when there is no such file.
///
/// Loading happens before logging is set up, so reporting a missing file is
/// left to [`warn_missing`].
pub fn load(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(Some(config))
}

pub fn warn_missing(path: &Path) {
    warn!(
        path = %path.display(),
        "configuration file not found; using defaults"
    );
}
