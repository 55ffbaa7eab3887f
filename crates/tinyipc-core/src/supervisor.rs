//! Worker process supervision.
//!
//! [`spawn`] starts a worker, wires its stdin/stdout into a [`Transport`]
//! and hands ownership of the OS process to a watcher task. The watcher is
//! the only code that touches the `Child`: it records how the process ended
//! and closes the transport so callers waiting on the worker are released.
//!
//! Lifecycle: `Starting → Ready → Running → Exited | Crashed`.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tinyipc_protocol::{CloseHandle, Transport};

use crate::config::{LaunchSpec, StderrMode};
use crate::error::SpawnError;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The process is being started.
    Starting,
    /// The process runs and its pipes are attached.
    Ready,
    /// A client is exchanging calls with the process.
    Running,
    /// The process exited with code 0.
    Exited,
    /// The process exited with a non-zero code or was killed.
    Crashed,
}

impl WorkerState {
    /// Returns true once the process is gone.
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Exited | Self::Crashed)
    }
}

/// Snapshot of a worker's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Current state.
    pub state: WorkerState,
    /// Exit code, once exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
    /// When the process was seen to terminate.
    pub exited_at: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    fn starting() -> Self {
        Self {
            state: WorkerState::Starting,
            exit_code: None,
            signal: None,
            started_at: Utc::now(),
            exited_at: None,
        }
    }

    fn record_exit(&mut self, exit: ExitStatus) {
        self.state = if exit.success() {
            WorkerState::Exited
        } else {
            WorkerState::Crashed
        };
        self.exit_code = exit.code();
        self.signal = exit_signal(exit);
        self.exited_at = Some(Utc::now());
    }

    /// Returns how long the process ran, or has been running.
    pub fn uptime(&self) -> Duration {
        let end = self.exited_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.state, self.exit_code, self.signal) {
            (WorkerState::Exited, _, _) => write!(f, "exited cleanly"),
            (WorkerState::Crashed, Some(code), _) => write!(f, "crashed with exit code {code}"),
            (WorkerState::Crashed, None, Some(signal)) => {
                write!(f, "crashed, killed by signal {signal}")
            }
            (WorkerState::Crashed, None, None) => write!(f, "crashed"),
            (WorkerState::Starting, ..) => write!(f, "starting"),
            (WorkerState::Ready, ..) => write!(f, "ready"),
            (WorkerState::Running, ..) => write!(f, "running"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(exit: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    exit.signal()
}

#[cfg(not(unix))]
fn exit_signal(_exit: ExitStatus) -> Option<i32> {
    None
}

/// Handle to a spawned worker process.
///
/// The process itself is owned by a background watcher task; this handle
/// observes its state and asks for termination.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    program: String,
    status_tx: Arc<watch::Sender<WorkerStatus>>,
    status_rx: watch::Receiver<WorkerStatus>,
    kill_tx: mpsc::Sender<()>,
    close: CloseHandle,
}

/// Starts a worker and returns its handle and transport.
///
/// The handle is `Ready` on return: the worker's pipes are attached, but the
/// worker application may still be initializing. Must be called from within
/// a Tokio runtime.
pub fn spawn(spec: &LaunchSpec) -> Result<(WorkerProcess, Transport), SpawnError> {
    let program = spec.program.display().to_string();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(match spec.stderr {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Forward => Stdio::piped(),
            StderrMode::Discard => Stdio::null(),
        })
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    let (status_tx, status_rx) = watch::channel(WorkerStatus::starting());

    let mut child = command.spawn().map_err(|source| {
        error!(program = %program, error = %source, "Failed to spawn worker");
        SpawnError::Launch {
            program: program.clone(),
            source,
        }
    })?;
    let pid = child.id();
    debug!(program = %program, pid, "Worker process started");

    let stdin = child
        .stdin
        .take()
        .ok_or(SpawnError::MissingStream { stream: "stdin" })?;
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingStream { stream: "stdout" })?;
    if let Some(stderr) = child.stderr.take() {
        forward_stderr(stderr, pid);
    }

    let transport = Transport::child(stdout, stdin);
    let close = transport.close_handle();
    status_tx.send_modify(|status| status.state = WorkerState::Ready);
    info!(program = %program, pid, "Worker ready");

    let status_tx = Arc::new(status_tx);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    tokio::spawn(watch_process(
        child,
        kill_rx,
        status_tx.clone(),
        close.clone(),
        pid,
    ));

    Ok((
        WorkerProcess {
            pid,
            program,
            status_tx,
            status_rx,
            kill_tx,
            close,
        },
        transport,
    ))
}

impl WorkerProcess {
    /// Returns the OS process id, if the process was still running when
    /// spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the program the worker was started from.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the current status.
    pub fn status(&self) -> WorkerStatus {
        self.status_rx.borrow().clone()
    }

    /// Returns a receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_rx.clone()
    }

    /// Moves a `Ready` worker to `Running`.
    pub fn mark_running(&self) {
        self.status_tx.send_if_modified(|status| {
            if status.state == WorkerState::Ready {
                status.state = WorkerState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Waits until the process has terminated and returns its final status.
    pub async fn wait(&self) -> WorkerStatus {
        let mut rx = self.status_rx.clone();
        let result = rx
            .wait_for(|status| status.state.is_terminated())
            .await
            .map(|status| status.clone());
        match result {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Stops the worker.
    ///
    /// The transport is closed first so the worker sees end of stream on its
    /// stdin and can exit by itself. If it is still alive after `grace`, it
    /// is killed.
    pub async fn terminate(&self, grace: Duration) -> WorkerStatus {
        let status = self.status();
        if status.state.is_terminated() {
            return status;
        }

        debug!(pid = self.pid, "Closing worker input");
        self.close.close();

        if let Ok(status) = tokio::time::timeout(grace, self.wait()).await {
            return status;
        }

        warn!(
            pid = self.pid,
            grace_ms = grace.as_millis(),
            "Worker did not exit within grace period, killing"
        );
        let _ = self.kill_tx.try_send(());
        self.wait().await
    }
}

async fn watch_process(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    status: Arc<watch::Sender<WorkerStatus>>,
    close: CloseHandle,
    pid: Option<u32>,
) {
    // A dropped handle counts as a kill request.
    let mut killing = false;
    let exit = loop {
        tokio::select! {
            result = child.wait() => break result,
            request = kill_rx.recv(), if !killing => {
                if request.is_none() {
                    debug!(pid, "Worker handle dropped");
                }
                killing = true;
                if let Err(e) = child.start_kill() {
                    warn!(pid, error = %e, "Failed to kill worker");
                }
            }
        }
    };

    match exit {
        Ok(exit) => {
            status.send_modify(|s| s.record_exit(exit));
            let current = status.borrow().clone();
            if current.state == WorkerState::Exited {
                info!(pid, "Worker exited");
            } else {
                warn!(
                    pid,
                    exit_code = current.exit_code,
                    signal = current.signal,
                    "Worker crashed"
                );
            }
        }
        Err(e) => {
            error!(pid, error = %e, "Failed to wait for worker");
            status.send_modify(|s| {
                s.state = WorkerState::Crashed;
                s.exited_at = Some(Utc::now());
            });
        }
    }

    close.close();
}

fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "tinyipc::worker", pid, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(pid, error = %e, "Stopped reading worker stderr");
                    break;
                }
            }
        }
    });
}
