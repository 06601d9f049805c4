//! Run an external command with an idle timeout: capture stdout and stderr,
//! and kill the process if it stops producing output without exiting.

pub mod command;
pub mod config;
pub mod error;
pub mod escape;
pub mod idle;
pub mod logging;
pub mod options;
pub mod runner;
pub mod spawner;
pub mod watcher;

pub use command::Command;
pub use config::RunConfig;
pub use error::{ConfigError, RunError};
pub use runner::{ProcessRunner, RunResult};
