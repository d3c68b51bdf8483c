//! Configuration vault – reads/writes `~/.rollbot/config.toml`.
//!
//! ```toml
//! address = "sim-0"
//! watchdog_interval_s = 10.0
//! watchdog_max_reconnects = 3
//!
//! [core]
//! min_interval_ms = 100
//! max_duration_ms = 2000
//! max_speed = 180
//! connect_timeout_s = 5.0
//! max_connect_attempts = 2
//! warm_start = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rollbot_runtime::WatchdogConfig;
use rollbot_types::CoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted user configuration stored in `~/.rollbot/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device address. When unset the toy is discovered at connect time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default = "default_watchdog_interval_s")]
    pub watchdog_interval_s: f64,

    /// Reconnects the watchdog attempts per cycle.
    #[serde(default = "default_watchdog_max_reconnects")]
    pub watchdog_max_reconnects: u32,

    #[serde(default)]
    pub core: CoreConfig,
}

fn default_watchdog_interval_s() -> f64 {
    10.0
}
fn default_watchdog_max_reconnects() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            watchdog_interval_s: default_watchdog_interval_s(),
            watchdog_max_reconnects: default_watchdog_max_reconnects(),
            core: CoreConfig::default(),
        }
    }
}

impl Config {
    /// Watchdog settings; an unusable interval falls back to the default.
    pub fn watchdog(&self) -> WatchdogConfig {
        let defaults = WatchdogConfig::default();
        WatchdogConfig {
            interval: Duration::try_from_secs_f64(self.watchdog_interval_s)
                .ok()
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.interval),
            max_reconnects: self.watchdog_max_reconnects,
            ..defaults
        }
    }
}

/// Return the path to `~/.rollbot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rollbot").join("config.toml")
}

/// Load the config from disk with env overrides applied. Returns `None` if
/// the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ROLLBOT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROLLBOT_ADDRESS` | `address` |
/// | `ROLLBOT_WATCHDOG_INTERVAL_S` | `watchdog_interval_s` |
/// | `ROLLBOT_WATCHDOG_MAX_RECONNECTS` | `watchdog_max_reconnects` |
/// | `ROLLBOT_MAX_SPEED` | `core.max_speed` |
/// | `ROLLBOT_MIN_INTERVAL_MS` | `core.min_interval_ms` |
/// | `ROLLBOT_MAX_DURATION_MS` | `core.max_duration_ms` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("ROLLBOT_ADDRESS") {
        cfg.address = Some(v).filter(|a| !a.is_empty());
    }
    if let Some(v) = var("ROLLBOT_WATCHDOG_INTERVAL_S").and_then(|v| v.parse().ok()) {
        cfg.watchdog_interval_s = v;
    }
    if let Some(v) = var("ROLLBOT_WATCHDOG_MAX_RECONNECTS").and_then(|v| v.parse().ok()) {
        cfg.watchdog_max_reconnects = v;
    }
    if let Some(v) = var("ROLLBOT_MAX_SPEED").and_then(|v| v.parse().ok()) {
        cfg.core.max_speed = v;
    }
    if let Some(v) = var("ROLLBOT_MIN_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        cfg.core.min_interval_ms = v;
    }
    if let Some(v) = var("ROLLBOT_MAX_DURATION_MS").and_then(|v| v.parse().ok()) {
        cfg.core.max_duration_ms = v;
    }
}

/// Save the config, creating `~/.rollbot/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
