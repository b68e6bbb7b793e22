//! Worker process ownership: spawn, pipes, exit detection and termination.
//!
//! A [`WorkerHandle`] owns exactly one child process. A reaper task owns the
//! `Child` itself and publishes its exit status on a `watch` channel, so any
//! number of callers can wait for the exit while `stop` remains free to
//! signal and kill the process. Dropping the last reference to a handle kills
//! a process that is still running.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::PoisonError;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerCommand;

/// Default time a worker is given to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STDERR_CHUNK_SIZE: usize = 4096;

/// Exit status as published by the reaper task.
type ExitReport = Result<ExitStatus, String>;

/// Error type for worker spawning.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary (or the working directory) was not found.
    #[error("Worker binary not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied spawning worker: {0}")]
    PermissionDenied(String),
    /// A stdio pipe was not attached to the child.
    #[error("Worker {0} pipe not available")]
    MissingPipe(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(program.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Error type for waiting on a worker.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    /// The operating system failed to report the exit status.
    #[error("Failed to wait for worker exit: {0}")]
    Wait(String),
    /// The reaper task ended without publishing an exit status.
    #[error("Worker reaper ended without reporting an exit")]
    ReaperGone,
}

/// Error type for stopping a worker.
#[derive(thiserror::Error, Debug)]
pub enum StopError {
    /// The termination signal could not be delivered.
    #[error("Failed to signal worker {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    /// Exit could not be confirmed after the stop request.
    #[error("Failed to confirm worker exit: {0}")]
    Wait(#[from] WorkerError),
}

/// How a [`WorkerHandle::stop`] call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited; nothing was signalled.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period elapsed (or SIGTERM failed) and the process was killed.
    Killed,
}

/// A running worker process and its pipes.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    generation: u64,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: std::sync::Mutex<Option<ChildStdout>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    kill: CancellationToken,
}

impl WorkerHandle {
    /// Spawn a worker from the given command.
    ///
    /// `generation` identifies this worker among all workers spawned by one
    /// supervisor. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process cannot be started or a pipe is
    /// missing. A child that started without all of its pipes is killed.
    pub fn spawn(command: &WorkerCommand, generation: u64) -> Result<Self, SpawnError> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(command.program(), e))?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        let pid = child.id();
        tracing::info!(?pid, generation, program = %command.program(), "Worker started");

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        tokio::spawn(log_stderr(stderr, pid, generation));
        tokio::spawn(reap(child, kill.clone(), exit_tx, generation));

        Ok(Self {
            pid,
            generation,
            stdin: Mutex::new(Some(stdin)),
            stdout: std::sync::Mutex::new(Some(stdout)),
            exit_rx,
            kill,
        })
    }

    /// Get the process ID assigned at spawn time.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Get the generation this worker was spawned as.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check whether the process has exited and been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the process to exit.
    ///
    /// Never triggers termination; safe to call from several tasks at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the exit status could not be collected.
    pub async fn wait(&self) -> Result<ExitStatus, WorkerError> {
        let mut rx = self.exit_rx.clone();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| WorkerError::ReaperGone)?;

        match report.as_ref() {
            Some(Ok(status)) => Ok(*status),
            Some(Err(e)) => Err(WorkerError::Wait(e.clone())),
            None => Err(WorkerError::ReaperGone),
        }
    }

    /// Write one chunk to the worker's stdin and flush it.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` once the input has been closed, or any error from
    /// the underlying pipe.
    pub async fn write_input(&self, chunk: &[u8]) -> io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(input_closed)?;
        stdin.write_all(chunk).await?;
        stdin.flush().await
    }

    /// Lock the worker's stdin for a sequence of writes.
    ///
    /// The slot is `None` once the input has been closed.
    pub async fn input(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.stdin.lock().await
    }

    /// Close the worker's stdin. Subsequent writes fail with `BrokenPipe`.
    pub async fn close_input(&self) {
        self.stdin.lock().await.take();
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_output(&self) -> Option<ChildStdout> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop the worker: SIGTERM, then SIGKILL once `grace` has elapsed.
    ///
    /// Returns only after the exit has been confirmed. Calling `stop` on a
    /// worker whose exit has been reaped returns [`StopOutcome::AlreadyExited`]
    /// without signalling, so repeated calls are safe. A worker that exited
    /// but is not reaped yet still receives SIGTERM, which is harmless, and
    /// the call reports [`StopOutcome::Graceful`].
    ///
    /// # Errors
    ///
    /// Returns `StopError` if the exit could not be confirmed.
    pub async fn stop(&self, grace: Duration) -> Result<StopOutcome, StopError> {
        let Some(pid) = self.pid.filter(|_| !self.has_exited()) else {
            return Ok(StopOutcome::AlreadyExited);
        };

        tracing::info!(pid, generation = self.generation, "Stopping worker");

        if let Err(e) = send_terminate(pid) {
            tracing::warn!(pid, error = %e, "Failed to send SIGTERM, killing worker");
            return self.force_kill().await;
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, %status, "Worker stopped gracefully");
                Ok(StopOutcome::Graceful)
            }
            Ok(Err(e)) => Err(StopError::Wait(e)),
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "Worker did not stop gracefully, sending SIGKILL"
                );
                self.force_kill().await
            }
        }
    }

    async fn force_kill(&self) -> Result<StopOutcome, StopError> {
        self.kill.cancel();
        self.wait().await?;
        Ok(StopOutcome::Killed)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // No-op once the reaper has finished.
        self.kill.cancel();
    }
}

fn input_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker input closed")
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), StopError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| StopError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // ESRCH: exited between the liveness check and the signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(StopError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> Result<(), StopError> {
    Err(StopError::Signal {
        pid,
        reason: "graceful termination is not supported on this platform".to_string(),
    })
}

/// Own the child until it exits, killing it early when `kill` fires.
async fn reap(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitReport>>,
    generation: u64,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(generation, error = %e, "Kill request on finished worker");
            }
            child.wait().await
        }
    };

    match &status {
        Ok(status) => tracing::debug!(generation, %status, "Worker exited"),
        Err(e) => tracing::warn!(generation, error = %e, "Failed to collect worker exit status"),
    }

    exit_tx.send_replace(Some(status.map_err(|e| e.to_string())));
}

/// Forward the worker's stderr to the log until end-of-stream.
async fn log_stderr(mut stderr: ChildStderr, pid: Option<u32>, generation: u64) {
    let mut buf = vec![0u8; STDERR_CHUNK_SIZE];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                tracing::info!(
                    target: "worker_stderr",
                    ?pid,
                    generation,
                    "{}",
                    text.trim_end()
                );
            }
            Err(e) => {
                tracing::warn!(?pid, error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}
