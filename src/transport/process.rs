//! # Process transport: spawn, find, and kill worker processes.
//!
//! [`ProcessTransport`] is the narrow OS seam the supervisor depends on. The
//! built-in [`LocalProcessTransport`] spawns workers on the local machine,
//! recognizes running ones by scanning the process table, and delivers
//! `SIGKILL` to processes it did not necessarily spawn itself (the
//! existing-process policies operate on foreign PIDs).
//!
//! ## Rules
//! - [`kill`](ProcessTransport::kill) is a hard kill; graceful shutdown goes
//!   through the bridge, not through this trait.
//! - Killing a PID that is already gone is not an error.
//! - [`find_pid`](ProcessTransport::find_pid) returns [`PidStatus::Unknown`]
//!   when the platform offers no way to answer; callers proceed on a
//!   best-effort basis.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::OfficeError;
use crate::transport::{ProcessQuery, WorkerCommand};

/// Result of a process-table lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidStatus {
    /// A matching live process was found.
    Found(u32),
    /// No matching process exists.
    NotFound,
    /// The platform could not answer the query.
    Unknown,
}

/// Handle to one spawned (or attached) worker process.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// OS PID, if known.
    fn pid(&self) -> PidStatus;

    /// Exit code once the process has terminated, `None` while it runs.
    ///
    /// Signal-terminated processes report the conventional `128 + signal`.
    async fn exit_code(&self) -> Option<i32>;
}

/// Spawns and manages worker processes on behalf of the supervisor.
#[async_trait]
pub trait ProcessTransport: Send + Sync + 'static {
    /// Spawns a worker from the assembled command line.
    async fn spawn(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, OfficeError>;

    /// Looks up a live process matching the query markers.
    async fn find_pid(&self, query: &ProcessQuery) -> Result<PidStatus, OfficeError>;

    /// Delivers a hard kill to the given PID.
    async fn kill(&self, pid: u32) -> Result<(), OfficeError>;
}

/// Built-in transport for workers on the local machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalProcessTransport;

impl LocalProcessTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessTransport for LocalProcessTransport {
    async fn spawn(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, OfficeError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| OfficeError::Start {
                message: format!("failed to spawn {}: {err}", command.program.display()),
            })?;

        let pid = child.id();
        debug!(pid, program = %command.program.display(), "worker process spawned");
        Ok(Box::new(LocalWorkerProcess {
            pid,
            child: Mutex::new(child),
        }))
    }

    async fn find_pid(&self, query: &ProcessQuery) -> Result<PidStatus, OfficeError> {
        let mut entries = match tokio::fs::read_dir("/proc").await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "process table is not readable; lookup unsupported");
                return Ok(PidStatus::Unknown);
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if cmdline_matches(&entry.path(), query).await {
                return Ok(PidStatus::Found(pid));
            }
        }
        Ok(PidStatus::NotFound)
    }

    async fn kill(&self, pid: u32) -> Result<(), OfficeError> {
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // Already gone; killing is idempotent.
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(OfficeError::Stop {
                message: format!("failed to kill pid {pid}: {err}"),
            }),
        }
    }
}

/// True when the process command line carries both query markers.
async fn cmdline_matches(proc_dir: &Path, query: &ProcessQuery) -> bool {
    let Ok(raw) = tokio::fs::read(proc_dir.join("cmdline")).await else {
        return false;
    };
    let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
    cmdline.contains(&query.command) && cmdline.contains(&query.argument)
}

/// Worker spawned by [`LocalProcessTransport`].
struct LocalWorkerProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
}

#[async_trait]
impl WorkerProcess for LocalWorkerProcess {
    fn pid(&self) -> PidStatus {
        match self.pid {
            Some(pid) => PidStatus::Found(pid),
            None => PidStatus::Unknown,
        }
    }

    async fn exit_code(&self) -> Option<i32> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Some(render_exit(status)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "could not poll worker exit status");
                None
            }
        }
    }
}

/// Renders an exit status as a single code, `128 + signal` for killed ones.
fn render_exit(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectUrl;

    #[tokio::test]
    async fn test_find_pid_reports_not_found_for_unique_marker() {
        let query = ProcessQuery {
            command: "soffice".to_string(),
            argument: ConnectUrl::socket(59999).accept_string(),
        };
        let transport = LocalProcessTransport::new();
        let status = transport.find_pid(&query).await.unwrap();
        assert!(matches!(status, PidStatus::NotFound | PidStatus::Unknown));
    }

    #[tokio::test]
    async fn test_kill_on_exited_pid_is_ok() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let transport = LocalProcessTransport::new();
        transport.kill(pid).await.unwrap();
    }
}
