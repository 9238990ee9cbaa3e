//! Configuration loading from environment variables or a TOML file.
//!
//! Values come from `DBG_CORE_*` environment variables with defaults.
//! Invalid values fall back to defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `DBG_CORE_MAX_PENDING` | 0 | Max queued tasks per session (0 = unbounded) |
//! | `DBG_CORE_READ_AHEAD` | 0 | Extra units fetched past a trailing gap (max 4096) |
//! | `DBG_CORE_MAX_FETCH_UNITS` | 65536 | Largest single target read (units) |
//! | `DBG_CORE_SHUTDOWN_TIMEOUT_MS` | 5000 | Session drain grace period (ms) |
//! | `DBG_CORE_LOG_LEVEL` | info | Tracing filter directive |
//! | `DBG_CORE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `DBG_CORE_LOG_FILE` | unset | Log file path (stderr when unset) |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatcherConfig;
use crate::memory::CacheConfig;
use crate::session::SessionConfig;
use crate::telemetry::{LogConfig, LogFormat};

const MAX_READ_AHEAD: u64 = 4096;
const MIN_FETCH_UNITS: u64 = 64;
const MIN_SHUTDOWN_MS: u64 = 10;

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub max_pending: usize,
    pub read_ahead: u64,
    pub max_fetch_units: u64,
    pub shutdown_timeout_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

/// All configuration, from the environment or a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub max_pending: usize,
    pub read_ahead: u64,
    pub max_fetch_units: u64,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            max_pending: 0,
            read_ahead: 0,
            max_fetch_units: CacheConfig::default().max_fetch_units,
            shutdown_timeout: Duration::from_millis(5000),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Invalid config: {0}")]
    Parse(String),
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let level = std::env::var("DBG_CORE_LOG_LEVEL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(defaults.level);
    let format = std::env::var("DBG_CORE_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    let output_path = std::env::var_os("DBG_CORE_LOG_FILE").map(PathBuf::from);
    LogConfig { format, level, output_path }
}

/// Apply floors and clamps shared by every source.
fn normalize(mut cfg: EnvConfig) -> EnvConfig {
    cfg.read_ahead = cfg.read_ahead.min(MAX_READ_AHEAD);
    cfg.max_fetch_units = cfg.max_fetch_units.max(MIN_FETCH_UNITS);
    let ms = (cfg.shutdown_timeout.as_millis() as u64).max(MIN_SHUTDOWN_MS);
    cfg.shutdown_timeout = Duration::from_millis(ms);
    cfg
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> EnvConfig {
    let defaults = EnvConfig::default();
    normalize(EnvConfig {
        max_pending: parse_usize("DBG_CORE_MAX_PENDING", defaults.max_pending),
        read_ahead: parse_u64("DBG_CORE_READ_AHEAD", defaults.read_ahead),
        max_fetch_units: parse_u64("DBG_CORE_MAX_FETCH_UNITS", defaults.max_fetch_units),
        shutdown_timeout: Duration::from_millis(parse_u64("DBG_CORE_SHUTDOWN_TIMEOUT_MS", 5000)),
        log: load_log_config(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    dispatcher: DispatcherSection,
    cache: CacheConfig,
    logging: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DispatcherSection {
    max_pending: usize,
    shutdown_timeout_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { max_pending: 0, shutdown_timeout_ms: 5000 }
    }
}

/// Parse configuration from TOML. Missing keys take their defaults.
///
/// ```toml
/// [dispatcher]
/// max_pending = 1024
/// shutdown_timeout_ms = 2000
///
/// [cache]
/// read_ahead = 64
/// max_fetch_units = 4096
///
/// [logging]
/// level = "dbg_core=debug"
/// format = "pretty"
/// ```
pub fn from_toml_str(text: &str) -> Result<EnvConfig, ConfigError> {
    let file: FileConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok(normalize(EnvConfig {
        max_pending: file.dispatcher.max_pending,
        read_ahead: file.cache.read_ahead,
        max_fetch_units: file.cache.max_fetch_units,
        shutdown_timeout: Duration::from_millis(file.dispatcher.shutdown_timeout_ms),
        log: file.logging,
    }))
}

/// Read and parse a TOML config file.
pub fn load_file(path: &Path) -> Result<EnvConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read { path: path.to_path_buf(), message: e.to_string() })?;
    from_toml_str(&text)
}

impl EnvConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            dispatcher: DispatcherConfig {
                max_pending: self.max_pending,
                shutdown_timeout: self.shutdown_timeout,
            },
            cache: CacheConfig { read_ahead: self.read_ahead, max_fetch_units: self.max_fetch_units },
        }
    }

    pub fn log_config(&self) -> LogConfig {
        self.log.clone()
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            max_pending: self.max_pending,
            read_ahead: self.read_ahead,
            max_fetch_units: self.max_fetch_units,
            shutdown_timeout_ms: self.shutdown_timeout.as_millis() as u64,
            log_level: self.log.level.clone(),
            log_format: self.log.format,
            log_file: self.log.output_path.clone(),
        }
    }
}
