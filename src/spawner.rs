/// Process spawning and forced termination.
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::error::RunError;
use crate::escape::split_command_line;

/// A started process: its pid, output pipes and exit awaiter.
#[derive(Debug)]
pub struct SpawnedProcess {
    pid: u32,
    child: Child,
    pipes: Option<(ChildStdout, ChildStderr)>,
}

/// What a forced kill found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The process (group) no longer existed; it exited on its own first.
    AlreadyExited,
}

impl SpawnedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand out stdout and stderr. Returns `None` once taken.
    pub fn take_pipes(&mut self) -> Option<(ChildStdout, ChildStderr)> {
        self.pipes.take()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, RunError> {
        self.child
            .wait()
            .await
            .map_err(|e| RunError::Io { source: e })
    }
}

/// Start `command_line` with stdin closed and stdout/stderr piped.
///
/// The first word is executed directly rather than through a shell, so a
/// missing or non-executable binary fails here instead of becoming a
/// shell exit code. The child leads its own process group so
/// [`force_kill`] reaches anything it starts.
pub fn spawn(command_line: &str) -> Result<SpawnedProcess, RunError> {
    let argv = split_command_line(command_line)?;
    let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                RunError::CommandNotFound {
                    command: command_line.to_string(),
                    source: e,
                }
            }
            _ => RunError::Io { source: e },
        })?;

    let pid = child.id().ok_or_else(|| RunError::Io {
        source: std::io::Error::other("spawned process has no pid"),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| RunError::Io {
        source: std::io::Error::other("stdout pipe was not available"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| RunError::Io {
        source: std::io::Error::other("stderr pipe was not available"),
    })?;

    tracing::debug!(pid, command = %command_line, "process spawned");

    Ok(SpawnedProcess {
        pid,
        child,
        pipes: Some((stdout, stderr)),
    })
}

/// Send SIGKILL to the process group led by `pid`.
///
/// A group that is already gone is not an error: it raced us to the exit.
pub fn force_kill(pid: u32) -> Result<KillOutcome, RunError> {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            tracing::debug!(pid, "sent SIGKILL to process group");
            Ok(KillOutcome::Killed)
        }
        Err(Errno::ESRCH) => {
            tracing::warn!(pid, "process already exited before it could be killed");
            Ok(KillOutcome::AlreadyExited)
        }
        Err(source) => Err(RunError::Kill { pid, source }),
    }
}
