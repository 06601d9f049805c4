/// Run supervision: spawn a command, drain its output on a worker task, kill it
/// if it goes idle, and assemble the result.
///
/// One worker task multiplexes both output streams and the idle timer ticks.
/// The calling task waits on whichever comes first: the process exiting, or
/// the worker signalling an idle timeout. Every outcome past spawning detaches
/// the watchers, stops the timer and joins the worker before returning.
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::command::{build_command, Command};
use crate::config::RunConfig;
use crate::error::{ConfigError, RunError};
use crate::idle::IdleTimer;
use crate::spawner::{self, KillOutcome};
use crate::watcher::{ActivityWatcher, StreamKind};

/// Result of a run that finished on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    /// `true` exactly when the exit code is 0.
    pub succeeded: bool,
    /// Exit code (None if terminated by a signal).
    pub exit_code: Option<i32>,
    pub pid: u32,
    /// Wall-clock time from spawn to result.
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Spawning,
    Running,
    Completed,
    TimedOut,
    SpawnFailed,
    WaitFailed,
}

/// How the wait for the process ended.
enum WaitOutcome {
    Exited(Result<ExitStatus, RunError>),
    IdleTimeout,
}

type Captured = (Vec<u8>, Vec<u8>);

/// Runs external commands with an idle timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunConfig,
}

impl ProcessRunner {
    pub fn new(config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The command line `run` would execute, with the configured nice applied.
    pub fn build_command(&self, command: &Command) -> Result<String, RunError> {
        Ok(build_command(command, self.config.nice)?)
    }

    /// Run `binary` with `args` and capture its output.
    ///
    /// A single `args` element is treated as a pre-joined argument string;
    /// several elements are kept as discrete arguments.
    pub async fn run<B, I, S>(&self, binary: B, args: I) -> Result<RunResult, RunError>
    where
        B: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_command(&Command::new(binary, args)).await
    }

    pub async fn run_command(&self, command: &Command) -> Result<RunResult, RunError> {
        let command_line = self.build_command(command)?;
        self.run_line(&command_line).await
    }

    async fn run_line(&self, command_line: &str) -> Result<RunResult, RunError> {
        let start = Instant::now();
        log_state(RunState::Spawning, None);

        let mut process = match spawner::spawn(command_line) {
            Ok(process) => process,
            Err(e) => {
                log_state(RunState::SpawnFailed, None);
                return Err(e);
            }
        };
        let pid = process.pid();
        tracing::info!(pid, command = %command_line, "process started");

        let (stdout, stderr) = process.take_pipes().ok_or_else(|| RunError::Io {
            source: std::io::Error::other("output pipes were already taken"),
        })?;

        let timer = IdleTimer::new(self.config.idle_timeout, self.config.check_interval);
        let out_watcher = ActivityWatcher::new(StreamKind::Stdout, stdout, timer.clock());
        let err_watcher = ActivityWatcher::new(StreamKind::Stderr, stderr, timer.clock());

        let (timeout_tx, timeout_rx) = oneshot::channel::<()>();
        let (detach_tx, detach_rx) = oneshot::channel::<()>();
        let mut worker = tokio::spawn(drive_watchers(
            out_watcher,
            err_watcher,
            timer,
            timeout_tx,
            detach_rx,
        ));
        log_state(RunState::Running, Some(pid));

        let outcome = tokio::select! {
            biased;
            status = process.wait() => WaitOutcome::Exited(status),
            Ok(()) = timeout_rx => WaitOutcome::IdleTimeout,
        };

        match outcome {
            WaitOutcome::Exited(Ok(status)) => {
                let (stdout, stderr) =
                    drain_worker(&mut worker, detach_tx, self.config.drain_timeout, pid).await?;
                let exit_code = status.code();
                let result = RunResult {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    succeeded: exit_code == Some(0),
                    exit_code,
                    pid,
                    duration: start.elapsed(),
                };
                log_state(RunState::Completed, Some(pid));
                tracing::info!(
                    pid,
                    exit_code = ?exit_code,
                    stdout_bytes = stdout.len(),
                    stderr_bytes = stderr.len(),
                    elapsed_ms = result.duration.as_millis() as u64,
                    "process completed"
                );
                Ok(result)
            }
            WaitOutcome::Exited(Err(e)) => {
                tracing::error!(pid, error = %e, "failed waiting for process");
                let killed = spawner::force_kill(pid);
                finish_wait_error(pid, killed, worker, detach_tx, e).await
            }
            WaitOutcome::IdleTimeout => {
                let timeout = self.config.idle_timeout;
                tracing::warn!(
                    pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "no activity within idle timeout, killing process"
                );
                let killed = spawner::force_kill(pid);
                if killed.is_ok() {
                    // reap it so the pid is really gone before we report
                    if let Err(e) = process.wait().await {
                        tracing::warn!(pid, error = %e, "failed to reap killed process");
                    }
                }
                finish_timeout(pid, killed, worker, detach_tx, timeout).await
            }
        }
    }
}

/// Stop the worker after an idle kill, then report the timeout. A kill that
/// failed outright is reported instead, once the worker has been joined.
async fn finish_timeout(
    pid: u32,
    killed: Result<KillOutcome, RunError>,
    worker: JoinHandle<Captured>,
    detach_tx: oneshot::Sender<()>,
    timeout: Duration,
) -> Result<RunResult, RunError> {
    detach_worker(worker, detach_tx).await?;
    log_state(RunState::TimedOut, Some(pid));
    killed?;
    Err(RunError::Timeout { timeout })
}

/// Stop the worker after waiting on the process failed. The wait error wins
/// over any kill failure, which is only logged.
async fn finish_wait_error(
    pid: u32,
    killed: Result<KillOutcome, RunError>,
    worker: JoinHandle<Captured>,
    detach_tx: oneshot::Sender<()>,
    error: RunError,
) -> Result<RunResult, RunError> {
    if let Err(kill_err) = killed {
        tracing::warn!(pid, error = %kill_err, "failed to kill process after wait error");
    }
    detach_worker(worker, detach_tx).await?;
    log_state(RunState::WaitFailed, Some(pid));
    Err(error)
}

fn log_state(state: RunState, pid: Option<u32>) {
    tracing::debug!(?state, pid = ?pid, "run state");
}

/// Event loop for the worker task: pump both streams, check the idle timer,
/// and stop everything on a detach request.
///
/// Keeps going while any stream is still open or the timer is armed. The timer
/// disarms itself after firing once, or when nobody is listening for the
/// timeout any more.
async fn drive_watchers<O, E>(
    mut out: ActivityWatcher<O>,
    mut err: ActivityWatcher<E>,
    mut timer: IdleTimer,
    timeout_tx: oneshot::Sender<()>,
    mut detach_rx: oneshot::Receiver<()>,
) -> Captured
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut ticker = timer.tick_interval();
    let mut timeout_tx = Some(timeout_tx);

    while out.is_attached() || err.is_attached() || timer.is_armed() {
        tokio::select! {
            _ = out.pump(), if out.is_attached() => {}
            _ = err.pump(), if err.is_attached() => {}
            _ = ticker.tick(), if timer.is_armed() => {
                if timeout_tx.as_ref().map_or(true, |tx| tx.is_closed()) {
                    tracing::debug!("process finished, stopping idle timer");
                    timer.disarm();
                } else if timer.on_tick(Instant::now()) {
                    if let Some(tx) = timeout_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            _ = &mut detach_rx => {
                tracing::debug!(
                    stdout_attached = out.is_attached(),
                    stderr_attached = err.is_attached(),
                    "detaching watchers"
                );
                out.detach();
                err.detach();
                timer.disarm();
            }
        }
    }

    tracing::debug!(
        stream = %out.kind(),
        bytes = out.captured().len(),
        "watcher finished"
    );
    tracing::debug!(
        stream = %err.kind(),
        bytes = err.captured().len(),
        "watcher finished"
    );
    (out.into_output(), err.into_output())
}

/// After a normal exit: let the worker read up to end-of-stream, but detach it
/// if the pipes stay open past `drain_timeout` (e.g. held by a grandchild).
async fn drain_worker(
    worker: &mut JoinHandle<Captured>,
    detach_tx: oneshot::Sender<()>,
    drain_timeout: Duration,
    pid: u32,
) -> Result<Captured, RunError> {
    match tokio::time::timeout(drain_timeout, &mut *worker).await {
        Ok(joined) => joined.map_err(join_error),
        Err(_elapsed) => {
            tracing::warn!(
                pid,
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "output still open after process exit, detaching watchers"
            );
            let _ = detach_tx.send(());
            worker.await.map_err(join_error)
        }
    }
}

/// Detach the watchers right away and join the worker.
async fn detach_worker(
    worker: JoinHandle<Captured>,
    detach_tx: oneshot::Sender<()>,
) -> Result<Captured, RunError> {
    let _ = detach_tx.send(());
    worker.await.map_err(join_error)
}

fn join_error(e: tokio::task::JoinError) -> RunError {
    RunError::Io {
        source: std::io::Error::other(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use tokio::io::AsyncWriteExt;

    fn runner(idle_timeout: Duration) -> ProcessRunner {
        ProcessRunner::new(RunConfig::new(idle_timeout).unwrap()).unwrap()
    }

    /// A worker reading from a duplex pipe that never goes idle on its own.
    fn idle_worker() -> (
        tokio::io::DuplexStream,
        JoinHandle<Captured>,
        oneshot::Sender<()>,
        oneshot::Receiver<()>,
    ) {
        let (tx, rx) = tokio::io::duplex(64);
        let timer = IdleTimer::new(Duration::from_secs(60), Duration::from_millis(10));
        let out = ActivityWatcher::new(StreamKind::Stdout, rx, timer.clock());
        let err = ActivityWatcher::new(StreamKind::Stderr, &b""[..], timer.clock());
        let (timeout_tx, timeout_rx) = oneshot::channel();
        let (detach_tx, detach_rx) = oneshot::channel();
        let worker = tokio::spawn(drive_watchers(out, err, timer, timeout_tx, detach_rx));
        (tx, worker, detach_tx, timeout_rx)
    }

    #[tokio::test]
    async fn test_run_echo() {
        let result = runner(Duration::from_secs(5))
            .run("echo", ["hello world"])
            .await
            .unwrap();

        assert_eq!(result.stdout, "hello world\n");
        assert_eq!(result.stderr, "");
        assert!(result.succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.pid > 0);
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr_separately() {
        let result = runner(Duration::from_secs(5))
            .run("sh", ["-c", "echo out-1; echo err-1 >&2; echo out-2; echo err-2 >&2"])
            .await
            .unwrap();

        assert_eq!(result.stdout, "out-1\nout-2\n");
        assert_eq!(result.stderr, "err-1\nerr-2\n");
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_keeps_output() {
        let result = runner(Duration::from_secs(5))
            .run("sh", ["-c", "echo partial; echo broken >&2; exit 42"])
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.exit_code, Some(42));
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.stderr, "broken\n");
    }

    #[tokio::test]
    async fn test_run_captures_output_larger_than_pipe_buffer() {
        let result = runner(Duration::from_secs(5))
            .run("sh", ["-c", "head -c 300000 /dev/zero | tr '\\0' a"])
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.stdout.len(), 300_000);
        assert!(result.stdout.bytes().all(|b| b == b'a'));
    }

    #[tokio::test]
    async fn test_run_idle_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > '{}'; sleep 2; echo late", pid_file.display());

        let start = Instant::now();
        let err = runner(Duration::from_secs(1))
            .run("sh", ["-c", script.as_str()])
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, RunError::Timeout { timeout } if timeout == Duration::from_secs(1)));
        assert!(elapsed >= Duration::from_millis(950), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1900), "fired late: {elapsed:?}");

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_run_steady_output_keeps_process_alive() {
        // runs ~1.5s in total, but never goes 1s without output
        let result = runner(Duration::from_secs(1))
            .run("sh", ["-c", "for i in 1 2 3 4 5; do echo $i; sleep 0.3; done"])
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.stdout, "1\n2\n3\n4\n5\n");
        assert!(result.duration >= Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_run_stderr_counts_as_activity() {
        let result = runner(Duration::from_secs(1))
            .run("sh", ["-c", "for i in 1 2 3 4; do echo $i >&2; sleep 0.4; done"])
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.stderr, "1\n2\n3\n4\n");
    }

    #[tokio::test]
    async fn test_run_keeps_words_starting_with_hash() {
        let result = runner(Duration::from_secs(5))
            .run("echo", ["hello #world"])
            .await
            .unwrap();

        assert_eq!(result.stdout, "hello #world\n");
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        let err = runner(Duration::from_secs(1))
            .run("nonexistent-binary-xyz", ["--version"])
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_run_with_nice_wrapper() {
        let config = RunConfig::new(Duration::from_secs(5)).unwrap().with_nice(5);
        let runner = ProcessRunner::new(config).unwrap();

        let line = runner.build_command(&Command::new("echo", ["a b", "c"])).unwrap();
        assert!(line.starts_with("nice -n 5 sh -c "));

        let result = runner.run("echo", ["a b", "c"]).await.unwrap();
        assert_eq!(result.stdout, "a b c\n");
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn test_run_detaches_when_grandchild_holds_pipe() {
        let config = RunConfig {
            drain_timeout: Duration::from_millis(200),
            ..RunConfig::new(Duration::from_secs(5)).unwrap()
        };
        let runner = ProcessRunner::new(config).unwrap();

        let start = Instant::now();
        let result = runner.run("sh", ["-c", "sleep 3 & echo done"]).await.unwrap();

        assert_eq!(result.stdout, "done\n");
        assert!(result.succeeded);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_process_that_closes_output_still_times_out() {
        let err = runner(Duration::from_millis(500))
            .run("sh", ["-c", "exec >&- 2>&-; sleep 3"])
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RunConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(ProcessRunner::new(config).is_err());
    }

    #[test]
    fn test_run_result_serializes_duration_as_millis() {
        let result = RunResult {
            stdout: "out".to_string(),
            stderr: String::new(),
            succeeded: true,
            exit_code: Some(0),
            pid: 7,
            duration: Duration::from_millis(1234),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1234);
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["succeeded"], true);
    }

    #[tokio::test]
    async fn test_drive_watchers_detach_keeps_captured_bytes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let timer = IdleTimer::new(Duration::from_secs(60), Duration::from_millis(10));
        let out = ActivityWatcher::new(StreamKind::Stdout, rx, timer.clock());
        let err = ActivityWatcher::new(StreamKind::Stderr, &b""[..], timer.clock());
        let (timeout_tx, _timeout_rx) = oneshot::channel();
        let (detach_tx, detach_rx) = oneshot::channel();

        let worker = tokio::spawn(drive_watchers(out, err, timer, timeout_tx, detach_rx));
        tx.write_all(b"before").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (stdout, stderr) = detach_worker(worker, detach_tx).await.unwrap();
        assert_eq!(stdout, b"before");
        assert!(stderr.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_drive_watchers_signals_timeout_once() {
        let timer = IdleTimer::new(Duration::from_millis(100), Duration::from_millis(10));
        let (_tx, rx) = tokio::io::duplex(64);
        let out = ActivityWatcher::new(StreamKind::Stdout, rx, timer.clock());
        let err = ActivityWatcher::new(StreamKind::Stderr, &b""[..], timer.clock());
        let (timeout_tx, timeout_rx) = oneshot::channel();
        let (detach_tx, detach_rx) = oneshot::channel();

        let worker = tokio::spawn(drive_watchers(out, err, timer, timeout_tx, detach_rx));
        tokio::time::timeout(Duration::from_secs(2), timeout_rx)
            .await
            .unwrap()
            .unwrap();

        detach_worker(worker, detach_tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_timeout_reports_kill_failure_after_stopping_worker() {
        let (mut tx, worker, detach_tx, _timeout_rx) = idle_worker();
        tx.write_all(b"partial").await.unwrap();

        let killed = Err(RunError::Kill {
            pid: 4242,
            source: Errno::EPERM,
        });
        let err = finish_timeout(4242, killed, worker, detach_tx, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunError::Kill {
                pid: 4242,
                source: Errno::EPERM
            }
        ));
        // worker was joined, so its end of the pipe is gone
        assert!(tx.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_finish_timeout_after_race_still_times_out() {
        let (mut tx, worker, detach_tx, _timeout_rx) = idle_worker();

        let timeout = Duration::from_millis(1500);
        let err = finish_timeout(4242, Ok(KillOutcome::AlreadyExited), worker, detach_tx, timeout)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Timeout { timeout: t } if t == timeout));
        assert!(tx.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_finish_wait_error_keeps_wait_error_over_kill_failure() {
        let (mut tx, worker, detach_tx, _timeout_rx) = idle_worker();

        let killed = Err(RunError::Kill {
            pid: 4242,
            source: Errno::EPERM,
        });
        let wait_err = RunError::Io {
            source: std::io::Error::other("wait failed"),
        };
        let err = finish_wait_error(4242, killed, worker, detach_tx, wait_err)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Io { .. }));
        assert!(err.to_string().contains("wait failed"));
        assert!(tx.write_all(b"late").await.is_err());
    }
}
