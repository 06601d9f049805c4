use clap::Parser;
use procwatch::config::{self, RunConfig};
use procwatch::{logging, Command, ProcessRunner, RunError, RunResult};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code reported when the command was killed for going idle.
const EXIT_TIMEOUT: u8 = 124;
/// Exit code reported when the command could not be found or executed.
const EXIT_NOT_FOUND: u8 = 127;
/// Exit code for bad configuration or arguments.
const EXIT_CONFIG: u8 = 2;

/// Run a command, capture its output, and kill it if it produces no output
/// for longer than the idle timeout.
#[derive(Parser, Debug)]
#[command(name = "procwatch", version, about)]
pub struct Cli {
    /// Config file path (default: procwatch.toml, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Priority adjustment passed to `nice -n` (overrides config)
    #[arg(short, long, allow_hyphen_values = true)]
    nice: Option<i32>,

    /// Print the result as JSON instead of replaying stdout/stderr
    #[arg(long)]
    json: bool,

    /// Print the command line that would run, don't run it
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (state transitions, watcher activity)
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Binary to run
    #[arg(value_name = "BINARY")]
    binary: String,

    /// Arguments; a single argument is word-split like a shell would
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    /// Resolve the run settings: file config first, then CLI overrides.
    fn run_config(&self) -> Result<RunConfig, procwatch::ConfigError> {
        let mut runner = config::load_or_default(self.config.as_deref())?.runner;
        if let Some(timeout) = self.timeout {
            runner.idle_timeout_secs = timeout;
        }
        if let Some(nice) = self.nice {
            runner.nice = nice;
        }
        runner.to_run_config()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let runner = match cli.run_config().and_then(ProcessRunner::new) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("procwatch: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let command = Command::new(cli.binary.as_str(), cli.args.iter().map(String::as_str));

    if cli.dry_run {
        return match runner.build_command(&command) {
            Ok(line) => {
                println!("{line}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("procwatch: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        };
    }

    match runner.run_command(&command).await {
        Ok(result) => report(&result, cli.json),
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("procwatch: {e}");
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

/// Replay the captured output (or print it as JSON) and mirror the exit code.
fn report(result: &RunResult, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("procwatch: failed to encode result: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let _ = std::io::stdout().write_all(result.stdout.as_bytes());
        let _ = std::io::stderr().write_all(result.stderr.as_bytes());
    }
    ExitCode::from(exit_code_for_result(result))
}

fn exit_code_for_result(result: &RunResult) -> u8 {
    match result.exit_code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}

fn exit_code_for_error(err: &RunError) -> u8 {
    match err {
        RunError::Timeout { .. } => EXIT_TIMEOUT,
        RunError::CommandNotFound { .. } => EXIT_NOT_FOUND,
        RunError::Escape(_) | RunError::EmptyCommand => EXIT_CONFIG,
        RunError::Kill { .. } | RunError::Io { .. } => 1,
    }
}
