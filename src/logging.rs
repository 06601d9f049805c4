/// Logging setup: `tracing` events to stderr, filtered by `PROCWATCH_LOG`.
///
/// stdout is left alone so a child's captured output can be replayed on it.
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive (e.g. `procwatch=debug`).
pub const LOG_ENV: &str = "PROCWATCH_LOG";

/// Pick the default level from CLI verbosity flags.
pub fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    match (verbose, quiet) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    }
}

/// Install the global subscriber. Call once, at startup.
pub fn init_logging(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}
