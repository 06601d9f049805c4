use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::idle::DEFAULT_CHECK_INTERVAL;

/// Default idle timeout, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 30.0;

/// Default time to wait for the output pipes to close after the process exits.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "procwatch.toml";

/// Top-level configuration loaded from procwatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProcwatchConfig {
    pub runner: RunnerConfig,
}

/// The `[runner]` table, as written in the file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub idle_timeout_secs: f64,
    pub nice: i32,
    pub check_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            nice: 0,
            check_interval_ms: DEFAULT_CHECK_INTERVAL.as_millis() as u64,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RunnerConfig {
    /// Validate and convert into the runner's settings.
    pub fn to_run_config(&self) -> Result<RunConfig, ConfigError> {
        let idle_timeout = Duration::try_from_secs_f64(self.idle_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::Invalid {
                field: "runner.idle_timeout_secs",
                reason: format!("must be a positive number, got {}", self.idle_timeout_secs),
            })?;
        let config = RunConfig {
            idle_timeout,
            nice: self.nice,
            check_interval: Duration::from_millis(self.check_interval_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Settings for a single [`crate::runner::ProcessRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Longest tolerated stretch with no output and no exit.
    pub idle_timeout: Duration,
    /// Scheduling priority adjustment; 0 leaves the command untouched.
    pub nice: i32,
    /// How often the idle timer checks the activity clock.
    pub check_interval: Duration,
    /// How long to keep draining output after exit before detaching the watchers.
    pub drain_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs_f64(DEFAULT_IDLE_TIMEOUT_SECS),
            nice: 0,
            check_interval: DEFAULT_CHECK_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl RunConfig {
    pub fn new(idle_timeout: Duration) -> Result<Self, ConfigError> {
        let config = Self {
            idle_timeout,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = nice;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "runner.idle_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "runner.check_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(-20..=19).contains(&self.nice) {
            return Err(ConfigError::Invalid {
                field: "runner.nice",
                reason: format!("must be between -20 and 19, got {}", self.nice),
            });
        }
        Ok(())
    }
}

/// Load configuration from a TOML file.
pub fn load(path: &Path) -> Result<ProcwatchConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Load `path` if given, else the default file if it exists, else defaults.
///
/// An explicitly named file must exist.
pub fn load_or_default(path: Option<&Path>) -> Result<ProcwatchConfig, ConfigError> {
    match path {
        Some(path) => load(path),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                load(&default_path)
            } else {
                tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                Ok(ProcwatchConfig::default())
            }
        }
    }
}
