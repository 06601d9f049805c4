/// Errors surfaced by the runner and its configuration.
use std::path::PathBuf;
use std::time::Duration;

use crate::escape::EscapeError;

/// Errors that can end a run without a `RunResult`.
#[derive(Debug)]
pub enum RunError {
    /// The binary could not be located or executed by the OS.
    CommandNotFound {
        command: String,
        source: std::io::Error,
    },
    /// The command line split into zero words.
    EmptyCommand,
    /// An argument could not be turned into a shell token.
    Escape(EscapeError),
    /// No output and no exit for at least the configured idle timeout.
    Timeout { timeout: Duration },
    /// Sending SIGKILL failed for a reason other than the process being gone.
    Kill {
        pid: u32,
        source: nix::errno::Errno,
    },
    /// Failed while waiting on the child or taking its pipes.
    Io { source: std::io::Error },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::CommandNotFound { command, source } => {
                write!(f, "can't find command - {}: {}", command, source)
            }
            RunError::EmptyCommand => write!(f, "command line is empty"),
            RunError::Escape(e) => write!(f, "failed to escape arguments: {}", e),
            RunError::Timeout { timeout } => {
                write!(f, "wait timeout error with {:.1} sec.", timeout.as_secs_f64())
            }
            RunError::Kill { pid, source } => {
                write!(f, "failed to kill process {}: {}", pid, source)
            }
            RunError::Io { source } => write!(f, "I/O error during run: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::CommandNotFound { source, .. } => Some(source),
            RunError::Escape(e) => Some(e),
            RunError::Kill { source, .. } => Some(source),
            RunError::Io { source } => Some(source),
            RunError::EmptyCommand | RunError::Timeout { .. } => None,
        }
    }
}

impl From<EscapeError> for RunError {
    fn from(e: EscapeError) -> Self {
        RunError::Escape(e)
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for our schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of range.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}
