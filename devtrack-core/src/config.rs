//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/devtrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/devtrack/` (~/.config/devtrack/)
//! - Data: `$XDG_DATA_HOME/devtrack/` (~/.local/share/devtrack/)
//! - State/Logs: `$XDG_STATE_HOME/devtrack/` (~/.local/state/devtrack/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Collector endpoint. When absent, every payload goes straight to the queue.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Retry queue configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Device detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector endpoint configuration
///
/// The endpoint URI is composed as `url:port/endpoint`, e.g.
/// `http://collector.local:8000/api/v1/usb-logs/`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Scheme and host (e.g., `http://127.0.0.1`)
    pub url: Option<String>,

    /// TCP port
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Request path
    #[serde(default = "default_server_endpoint")]
    pub endpoint: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            port: default_server_port(),
            endpoint: default_server_endpoint(),
            timeout_secs: default_server_timeout(),
        }
    }
}

impl ServerConfig {
    /// Full endpoint URI, or `None` when no url is configured
    pub fn uri(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim_end_matches('/');
        if url.is_empty() {
            return None;
        }
        Some(format!("{}:{}{}", url, self.port, self.endpoint))
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_server_port() -> u16 {
    8000
}

fn default_server_endpoint() -> String {
    "/api/v1/usb-logs/".to_string()
}

fn default_server_timeout() -> u64 {
    5
}

/// Retry queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Directory holding the on-disk queue
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,

    /// Maximum number of queued payloads before the oldest is discarded
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Maximum redelivery attempts per drain cycle
    #[serde(default = "default_cache_max_retries")]
    pub max_retries: usize,

    /// Seconds between drain cycles
    #[serde(default = "default_cache_retry_period")]
    pub retry_period_seconds: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            max_entries: default_cache_max_entries(),
            max_retries: default_cache_max_retries(),
            retry_period_seconds: default_cache_retry_period(),
        }
    }
}

impl CacheConfig {
    /// Drain period as a duration, clamped to the range `validate` accepts
    pub fn retry_period(&self) -> Duration {
        period_duration(self.retry_period_seconds)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::Config(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config(
                "cache.max_retries must be at least 1".to_string(),
            ));
        }
        validate_period("cache.retry_period_seconds", self.retry_period_seconds)
    }
}

fn default_cache_dir() -> PathBuf {
    Config::data_dir().join("queue")
}

fn default_cache_max_entries() -> usize {
    100
}

fn default_cache_max_retries() -> usize {
    20
}

fn default_cache_retry_period() -> f64 {
    300.0
}

/// Device detector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Seconds between device scans
    #[serde(default = "default_scan_period")]
    pub scan_period_seconds: f64,

    /// File holding the last observed device snapshot
    #[serde(default = "default_connected_devices_file")]
    pub connected_devices_filename: PathBuf,

    /// Root of the USB device tree in sysfs
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_period_seconds: default_scan_period(),
            connected_devices_filename: default_connected_devices_file(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl DetectorConfig {
    /// Scan period as a duration, clamped to the range `validate` accepts
    pub fn scan_period(&self) -> Duration {
        period_duration(self.scan_period_seconds)
    }
}

fn default_scan_period() -> f64 {
    1.0
}

fn default_connected_devices_file() -> PathBuf {
    Config::data_dir().join("connected_devices.json")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/bus/usb/devices")
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Shortest accepted period; anything faster just spins
const MIN_PERIOD: Duration = Duration::from_millis(10);
const MAX_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn validate_period(name: &str, seconds: f64) -> Result<()> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(period) if (MIN_PERIOD..=MAX_PERIOD).contains(&period) => Ok(()),
        _ => Err(Error::Config(format!(
            "{} must be between {} and {} seconds, got {}",
            name,
            MIN_PERIOD.as_secs_f64(),
            MAX_PERIOD.as_secs(),
            seconds
        ))),
    }
}

fn period_duration(seconds: f64) -> Duration {
    if seconds.is_nan() {
        return MIN_PERIOD;
    }
    let clamped = seconds.clamp(MIN_PERIOD.as_secs_f64(), MAX_PERIOD.as_secs_f64());
    Duration::try_from_secs_f64(clamped).unwrap_or(MIN_PERIOD)
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        validate_period(
            "detector.scan_period_seconds",
            self.detector.scan_period_seconds,
        )?;
        if let Some(server) = &self.server {
            if server.timeout_secs == 0 {
                return Err(Error::Config(
                    "server.timeout_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Collector endpoint URI, if one is configured
    pub fn endpoint_uri(&self) -> Option<String> {
        self.server.as_ref().and_then(ServerConfig::uri)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/devtrack/config.toml` (~/.config/devtrack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("devtrack").join("config.toml")
    }

    /// Returns the data directory path (queue, device snapshot)
    ///
    /// `$XDG_DATA_HOME/devtrack/` (~/.local/share/devtrack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("devtrack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/devtrack/` (~/.local/state/devtrack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("devtrack")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
