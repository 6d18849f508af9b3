//! # ProcessSupervisor: lifecycle actor for one worker process.
//!
//! Owns exactly one external worker process handle plus one
//! [`OfficeConnection`]. Every lifecycle operation — start, stop, restart —
//! is a command on one mpsc queue consumed by a single actor task, so
//! lifecycle operations never interleave for a given worker.
//!
//! ## Command flow
//! ```text
//! start()/stop()        ── Command{reply} ──►  ┌────────────────┐
//! request_restart(mode) ── Command        ──►  │ LifecycleActor │ (serial)
//!                                              └───────┬────────┘
//!                                   spawn / find_pid / kill (ProcessTransport)
//!                                   connect / terminate  (OfficeConnection)
//! ```
//!
//! ## Restart triggers
//! One restart operation, parameterized by [`RestartMode`]:
//! - `Requested` (quota reached): graceful stop, **preserve** the instance
//!   directory, respawn.
//! - `LostConnection` (crash): force-kill whatever remains, **wipe** the
//!   instance directory, respawn.
//! - `TaskTimeout`: force-kill only; the resulting disposal event re-enters
//!   through the `LostConnection` path.
//!
//! All three share the configured process timeout and retry interval.
//!
//! ## Failure semantics
//! `start()` reports synchronously; `start_detached()` logs failures instead.
//! Restart failures are always logged and never propagate — no caller is
//! synchronously waiting, the entry simply stays unavailable until a later
//! restart succeeds.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ExistingProcessAction, ProcessConfig};
use crate::connection::OfficeConnection;
use crate::error::OfficeError;
use crate::office::workdir;
use crate::retry::{Attempt, Retry};
use crate::transport::{
    BridgeError, BridgeTransport, PidStatus, ProcessQuery, ProcessTransport, WorkerCommand,
    WorkerProcess,
};

/// Exit code a worker uses to signal "profile needs reinitialization"; the
/// supervisor respawns once transparently when it sees it.
pub(crate) const EXIT_CODE_NEW_INSTALLATION: i32 = 81;

/// Lifecycle command queue depth. Small on purpose: commands are serialized
/// anyway, and a full queue means a restart is already pending.
const COMMAND_QUEUE: usize = 8;

/// Why a worker is being restarted; selects the cleanup policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartMode {
    /// Planned restart (task quota reached): graceful stop, profile kept.
    Requested,
    /// The connection was lost unexpectedly: force-kill, profile wiped.
    LostConnection,
    /// A task overran its budget: force-kill only, respawn driven by the
    /// resulting disposal event.
    TaskTimeout,
}

impl RestartMode {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RestartMode::Requested => "requested",
            RestartMode::LostConnection => "lost_connection",
            RestartMode::TaskTimeout => "task_timeout",
        }
    }
}

enum Command {
    Start {
        reply: Option<oneshot::Sender<Result<(), OfficeError>>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), OfficeError>>,
    },
    Restart {
        mode: RestartMode,
    },
}

/// Supervises one worker process: its handle, its connection, its restarts.
///
/// Created once per pool entry and reused across worker restarts; the
/// process handle and connection session inside are recreated on every
/// (re)start. Must be created inside a tokio runtime.
pub struct ProcessSupervisor {
    commands: mpsc::Sender<Command>,
    connection: Arc<OfficeConnection>,
    token: CancellationToken,
}

impl ProcessSupervisor {
    /// Creates the supervisor and spawns its lifecycle actor.
    pub fn new(
        cfg: ProcessConfig,
        process: Arc<dyn ProcessTransport>,
        bridge: Arc<dyn BridgeTransport>,
    ) -> Self {
        let connection = OfficeConnection::new(cfg.url.clone(), bridge);
        let token = CancellationToken::new();
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);

        let actor = LifecycleActor {
            cfg,
            process,
            connection: connection.clone(),
            token: token.clone(),
            worker: None,
            reuse_profile: false,
        };
        tokio::spawn(actor.run(receiver));

        Self {
            commands,
            connection,
            token,
        }
    }

    /// The connection this supervisor maintains.
    pub fn connection(&self) -> &Arc<OfficeConnection> {
        &self.connection
    }

    /// Starts the worker and waits for the outcome.
    pub async fn start(&self) -> Result<(), OfficeError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Start { reply: Some(reply) })
            .await
            .map_err(|_| OfficeError::Cancelled)?;
        outcome.await.map_err(|_| OfficeError::Cancelled)?
    }

    /// Starts the worker fire-and-forget; failures are logged by the actor.
    pub fn start_detached(&self) {
        if self.commands.try_send(Command::Start { reply: None }).is_err() {
            warn!(url = %self.connection.url(), "lifecycle queue full; start request dropped");
        }
    }

    /// Stops the worker and waits for the outcome.
    pub async fn stop(&self) -> Result<(), OfficeError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| OfficeError::Cancelled)?;
        outcome.await.map_err(|_| OfficeError::Cancelled)?
    }

    /// Queues a restart, fire-and-forget.
    ///
    /// Called from connection-event listeners and the task timeout path, so
    /// it must not block; a full queue means recovery is already in flight.
    pub fn request_restart(&self, mode: RestartMode) {
        let label = mode.as_label();
        if self.commands.try_send(Command::Restart { mode }).is_err() {
            debug!(url = %self.connection.url(), mode = label, "restart already pending");
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Unblocks any retry sleep inside the actor so it can observe the
        // closed command queue and exit.
        self.token.cancel();
    }
}

/// Handle to the one process this supervisor currently owns.
///
/// Absent when nothing runs, and also when the supervisor attached to a
/// foreign process under [`ExistingProcessAction::Connect`] — a foreign
/// process has no handle and no instance directory of ours.
struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    pid: PidStatus,
    instance_dir: PathBuf,
}

/// Outcome of waiting for a freshly spawned process to settle.
enum Spawned {
    Running(PidStatus),
    Exited(i32),
}

struct LifecycleActor {
    cfg: ProcessConfig,
    process: Arc<dyn ProcessTransport>,
    connection: Arc<OfficeConnection>,
    token: CancellationToken,
    worker: Option<WorkerHandle>,
    /// Set by a quota-driven stop: the next spawn reuses the instance
    /// directory instead of wiping it.
    reuse_profile: bool,
}

impl LifecycleActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start { reply } => {
                    let result = self.start().await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                error!(url = %self.cfg.url, error = %err, "background start failed");
                            }
                        }
                    }
                }
                Command::Stop { reply } => {
                    let _ = reply.send(self.stop(false).await);
                }
                Command::Restart { mode } => {
                    if let Err(err) = self.restart(mode).await {
                        error!(
                            url = %self.cfg.url,
                            mode = mode.as_label(),
                            error = %err,
                            "restart failed; worker stays down until the next trigger"
                        );
                    }
                }
            }
        }
        debug!(url = %self.cfg.url, "lifecycle actor stopped");
    }

    async fn start(&mut self) -> Result<(), OfficeError> {
        // Checked via the session, not the connection state: right after a
        // terminate the disposal watcher may not have flipped the state yet,
        // but the session already knows it is dead.
        let alive = self
            .connection
            .session()
            .map(|session| session.is_alive())
            .unwrap_or(false);
        if alive {
            debug!(url = %self.cfg.url, "worker already running; start ignored");
            return Ok(());
        }
        info!(url = %self.cfg.url, "starting office worker");

        let query = ProcessQuery::for_url(&self.cfg.url);
        if let Some(pid) = self.find_existing(&query).await? {
            match self.cfg.existing_process_action {
                ExistingProcessAction::Fail => {
                    return Err(OfficeError::ExistingProcess {
                        url: self.cfg.url.to_string(),
                    });
                }
                ExistingProcessAction::Connect => {
                    info!(url = %self.cfg.url, pid, "attaching to existing worker");
                    return self.connect_to_existing(&query).await;
                }
                ExistingProcessAction::Kill => {
                    info!(url = %self.cfg.url, pid, "killing existing worker");
                    self.kill_and_await_exit(pid, &query).await?;
                }
                ExistingProcessAction::ConnectOrKill => match self.connection.connect().await {
                    Ok(()) => {
                        info!(url = %self.cfg.url, pid, "attached to existing worker");
                        self.worker = None;
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(
                            url = %self.cfg.url,
                            pid,
                            error = %err,
                            "could not attach to existing worker; killing it"
                        );
                        self.kill_and_await_exit(pid, &query).await?;
                    }
                },
            }
        }

        self.spawn_and_connect(&query).await
    }

    /// Resolves the current occupant of the target address, if any.
    async fn find_existing(&self, query: &ProcessQuery) -> Result<Option<u32>, OfficeError> {
        match self.process.find_pid(query).await? {
            PidStatus::Found(pid) => Ok(Some(pid)),
            PidStatus::NotFound => Ok(None),
            PidStatus::Unknown => {
                debug!(url = %self.cfg.url, "process table not queryable; assuming address free");
                Ok(None)
            }
        }
    }

    /// Attaches to a foreign worker, retrying while it is still present.
    async fn connect_to_existing(&mut self, query: &ProcessQuery) -> Result<(), OfficeError> {
        let retry = Retry::new(self.cfg.process_retry_interval, self.cfg.process_timeout);
        let connection = self.connection.clone();
        let process = self.process.clone();
        let token = self.token.clone();
        let query = query.clone();

        retry
            .run(&token, || {
                let connection = connection.clone();
                let process = process.clone();
                let query = query.clone();
                async move {
                    match connection.connect().await {
                        Ok(()) => Ok(Attempt::Done(())),
                        Err(err) => match process.find_pid(&query).await? {
                            PidStatus::NotFound => Err(OfficeError::Start {
                                message: format!("existing worker vanished before connecting: {err}"),
                            }),
                            _ => Ok(Attempt::Retry(err)),
                        },
                    }
                }
            })
            .await?;

        self.worker = None;
        Ok(())
    }

    /// Kills the given PID and waits until it leaves the process table.
    async fn kill_and_await_exit(&self, pid: u32, query: &ProcessQuery) -> Result<(), OfficeError> {
        self.process.kill(pid).await?;

        let retry = Retry::new(self.cfg.process_retry_interval, self.cfg.process_timeout);
        let process = self.process.clone();
        let token = self.token.clone();
        let query = query.clone();
        retry
            .run(&token, || {
                let process = process.clone();
                let query = query.clone();
                async move {
                    match process.find_pid(&query).await? {
                        PidStatus::Found(pid) => Ok(Attempt::Retry(OfficeError::Stop {
                            message: format!("pid {pid} still present after kill"),
                        })),
                        _ => Ok(Attempt::Done(())),
                    }
                }
            })
            .await
    }

    async fn spawn_and_connect(&mut self, query: &ProcessQuery) -> Result<(), OfficeError> {
        let instance_dir = self.prepare_instance_dir().await?;
        let command = WorkerCommand::new(
            &self.cfg.office_home,
            &self.cfg.url,
            &instance_dir,
            &self.cfg.run_as_args,
        );

        let mut reinitialized = false;
        let handle = loop {
            let process = self.process.spawn(&command).await?;
            match self.await_pid(process.as_ref(), query).await? {
                Spawned::Running(pid) => {
                    break WorkerHandle {
                        process,
                        pid,
                        instance_dir,
                    };
                }
                Spawned::Exited(EXIT_CODE_NEW_INSTALLATION) if !reinitialized => {
                    info!(
                        url = %self.cfg.url,
                        "worker requested profile reinitialization; respawning once"
                    );
                    reinitialized = true;
                }
                Spawned::Exited(code) => {
                    return Err(OfficeError::Start {
                        message: format!("worker exited with code {code} before accepting connections"),
                    });
                }
            }
        };

        // Store the handle before connecting so a failed connect still leaves
        // something for stop() to clean up.
        let connect_result = self.connect_spawned(handle.process.as_ref()).await;
        self.worker = Some(handle);
        connect_result
    }

    /// Prepares the instance directory, honoring a quota-restart preservation.
    async fn prepare_instance_dir(&mut self) -> Result<PathBuf, OfficeError> {
        let dir = workdir::instance_dir(&self.cfg.working_dir, &self.cfg.url);
        let reuse = std::mem::take(&mut self.reuse_profile);
        if reuse && tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(dir = %dir.display(), "reusing preserved instance directory");
            return Ok(dir);
        }
        workdir::prepare(
            &self.cfg.working_dir,
            &self.cfg.url,
            self.cfg.template_profile_dir.as_deref(),
        )
        .await
    }

    /// Waits for a fresh spawn to either expose a PID or exit.
    async fn await_pid(
        &self,
        handle: &dyn WorkerProcess,
        query: &ProcessQuery,
    ) -> Result<Spawned, OfficeError> {
        let retry = Retry::new(self.cfg.process_retry_interval, self.cfg.process_timeout);
        let process = self.process.clone();
        let token = self.token.clone();
        retry
            .run(&token, || {
                let process = process.clone();
                async move {
                    if let Some(code) = handle.exit_code().await {
                        return Ok(Attempt::Done(Spawned::Exited(code)));
                    }
                    match handle.pid() {
                        PidStatus::Found(pid) => Ok(Attempt::Done(Spawned::Running(PidStatus::Found(pid)))),
                        _ => match process.find_pid(query).await? {
                            PidStatus::Found(pid) => {
                                Ok(Attempt::Done(Spawned::Running(PidStatus::Found(pid))))
                            }
                            PidStatus::Unknown => Ok(Attempt::Done(Spawned::Running(PidStatus::Unknown))),
                            PidStatus::NotFound => Ok(Attempt::Retry(OfficeError::Start {
                                message: "spawned worker not visible in the process table yet".to_string(),
                            })),
                        },
                    }
                }
            })
            .await
    }

    /// Retry-connects against a fresh spawn. Failure with the process dead is
    /// fatal; with the process alive it is temporary.
    async fn connect_spawned(&self, handle: &dyn WorkerProcess) -> Result<(), OfficeError> {
        let retry = Retry::with_delay(
            self.cfg.after_start_delay,
            self.cfg.process_retry_interval,
            self.cfg.process_timeout,
        );
        let connection = self.connection.clone();
        let token = self.token.clone();
        retry
            .run(&token, || {
                let connection = connection.clone();
                async move {
                    match connection.connect().await {
                        Ok(()) => Ok(Attempt::Done(())),
                        Err(err) => match handle.exit_code().await {
                            Some(code) => Err(OfficeError::Start {
                                message: format!("worker died before connecting (exit code {code}): {err}"),
                            }),
                            None => Ok(Attempt::Retry(err)),
                        },
                    }
                }
            })
            .await
    }

    async fn stop(&mut self, preserve_dir: bool) -> Result<(), OfficeError> {
        info!(url = %self.cfg.url, "stopping office worker");

        if self.cfg.keep_alive_on_shutdown {
            debug!(url = %self.cfg.url, "keep-alive: disconnecting only");
            self.connection.disconnect();
            self.worker = None;
            return Ok(());
        }

        if let Some(session) = self.connection.session() {
            match session.terminate().await {
                Ok(()) => debug!(url = %self.cfg.url, "termination requested over the bridge"),
                // The bridge being gone already is the normal case for a
                // worker that crashed or obeyed an earlier terminate.
                Err(BridgeError::Disposed) => {
                    debug!(url = %self.cfg.url, "bridge already disposed")
                }
                Err(err) => {
                    debug!(url = %self.cfg.url, error = %err, "terminate call failed; will kill by pid")
                }
            }
            session.close();
        }

        let query = ProcessQuery::for_url(&self.cfg.url);
        if let Err(err) = self.await_exit(&query).await {
            warn!(url = %self.cfg.url, error = %err, "worker did not exit gracefully; killing");
            if let Some(pid) = self.current_pid(&query).await {
                self.process.kill(pid).await?;
            }
            self.await_exit(&query).await.map_err(|err| OfficeError::Stop {
                message: format!("worker would not terminate: {err}"),
            })?;
        }

        if let Some(worker) = self.worker.take() {
            if preserve_dir {
                self.reuse_profile = true;
            } else {
                workdir::remove(&worker.instance_dir).await?;
            }
        }
        Ok(())
    }

    /// Waits for the current worker to exit: owned handles report an exit
    /// code, attached foreign workers vanish from the process table.
    async fn await_exit(&self, query: &ProcessQuery) -> Result<(), OfficeError> {
        let retry = Retry::new(self.cfg.process_retry_interval, self.cfg.process_timeout);
        let token = self.token.clone();
        retry
            .run(&token, || async move {
                match &self.worker {
                    Some(worker) => match worker.process.exit_code().await {
                        Some(code) => {
                            debug!(url = %self.cfg.url, code, "worker exited");
                            Ok(Attempt::Done(()))
                        }
                        None => Ok(Attempt::Retry(OfficeError::Stop {
                            message: "worker still running".to_string(),
                        })),
                    },
                    None => match self.process.find_pid(query).await? {
                        PidStatus::Found(pid) => Ok(Attempt::Retry(OfficeError::Stop {
                            message: format!("pid {pid} still present"),
                        })),
                        _ => Ok(Attempt::Done(())),
                    },
                }
            })
            .await
    }

    async fn current_pid(&self, query: &ProcessQuery) -> Option<u32> {
        if let Some(worker) = &self.worker {
            if let PidStatus::Found(pid) = worker.pid {
                return Some(pid);
            }
        }
        match self.process.find_pid(query).await {
            Ok(PidStatus::Found(pid)) => Some(pid),
            _ => None,
        }
    }

    async fn restart(&mut self, mode: RestartMode) -> Result<(), OfficeError> {
        info!(url = %self.cfg.url, mode = mode.as_label(), "restarting office worker");
        match mode {
            RestartMode::Requested => {
                self.stop(true).await?;
                self.start().await
            }
            RestartMode::LostConnection => {
                let query = ProcessQuery::for_url(&self.cfg.url);
                if let Some(pid) = self.current_pid(&query).await {
                    self.process.kill(pid).await?;
                }
                self.await_exit(&query).await?;
                if let Some(worker) = self.worker.take() {
                    workdir::remove(&worker.instance_dir).await?;
                }
                self.start().await
            }
            RestartMode::TaskTimeout => {
                let query = ProcessQuery::for_url(&self.cfg.url);
                match self.current_pid(&query).await {
                    Some(pid) => self.process.kill(pid).await,
                    // No PID to kill; close the session so the disposal
                    // event still fires and drives the respawn.
                    None => {
                        self.connection.disconnect();
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectUrl, MockOffice};
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(url: ConnectUrl, working_dir: &std::path::Path) -> ProcessConfig {
        ProcessConfig {
            url,
            office_home: PathBuf::from("/opt/office"),
            working_dir: working_dir.to_path_buf(),
            run_as_args: Vec::new(),
            template_profile_dir: None,
            existing_process_action: ExistingProcessAction::Kill,
            process_timeout: Duration::from_secs(5),
            process_retry_interval: Duration::from_millis(10),
            after_start_delay: Duration::ZERO,
            keep_alive_on_shutdown: false,
        }
    }

    fn supervisor(office: &MockOffice, cfg: ProcessConfig) -> ProcessSupervisor {
        ProcessSupervisor::new(cfg, Arc::new(office.clone()), Arc::new(office.clone()))
    }

    #[tokio::test]
    async fn test_start_spawns_and_connects() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let sup = supervisor(&office, config(ConnectUrl::socket(2002), dir.path()));

        sup.start().await.unwrap();

        assert!(sup.connection().is_connected());
        assert_eq!(office.spawn_count(), 1);
        assert_eq!(office.live_workers(), 1);
        assert!(workdir::instance_dir(dir.path(), &ConnectUrl::socket(2002)).is_dir());
    }

    #[tokio::test]
    async fn test_start_retries_refused_handshakes() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        office.refuse_opens(3);
        let sup = supervisor(&office, config(ConnectUrl::socket(2002), dir.path()));

        sup.start().await.unwrap();
        assert!(sup.connection().is_connected());
        assert!(office.open_attempts() >= 4);
    }

    #[tokio::test]
    async fn test_exit_81_respawns_once() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        office.exit_81_on_spawns(1);
        let sup = supervisor(&office, config(ConnectUrl::socket(2002), dir.path()));

        sup.start().await.unwrap();
        assert!(sup.connection().is_connected());
        assert_eq!(office.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_as_start_error() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        office.fail_spawns(true);
        let sup = supervisor(&office, config(ConnectUrl::socket(2002), dir.path()));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, OfficeError::Start { .. }));
        assert!(!sup.connection().is_connected());
    }

    #[tokio::test]
    async fn test_existing_process_fail_policy() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        office.seed_worker(&url, true);

        let mut cfg = config(url, dir.path());
        cfg.existing_process_action = ExistingProcessAction::Fail;
        let sup = supervisor(&office, cfg);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, OfficeError::ExistingProcess { .. }));
        // The foreign process is left alone.
        assert!(office.kills().is_empty());
        assert_eq!(office.live_workers(), 1);
    }

    #[tokio::test]
    async fn test_existing_process_kill_policy() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let foreign = office.seed_worker(&url, true);

        let sup = supervisor(&office, config(url, dir.path()));
        sup.start().await.unwrap();

        assert_eq!(office.kills(), vec![foreign]);
        assert_eq!(office.spawn_count(), 1);
        assert!(sup.connection().is_connected());
    }

    #[tokio::test]
    async fn test_existing_process_connect_policy_attaches() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        office.seed_worker(&url, true);

        let mut cfg = config(url, dir.path());
        cfg.existing_process_action = ExistingProcessAction::Connect;
        let sup = supervisor(&office, cfg);

        sup.start().await.unwrap();
        assert!(sup.connection().is_connected());
        assert_eq!(office.spawn_count(), 0);
        assert!(office.kills().is_empty());
    }

    #[tokio::test]
    async fn test_connect_or_kill_falls_back_to_spawn() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        // Occupies the address but refuses handshakes.
        let foreign = office.seed_worker(&url, false);

        let mut cfg = config(url, dir.path());
        cfg.existing_process_action = ExistingProcessAction::ConnectOrKill;
        let sup = supervisor(&office, cfg);

        sup.start().await.unwrap();
        assert!(sup.connection().is_connected());
        assert_eq!(office.kills(), vec![foreign]);
        assert_eq!(office.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_terminates_and_removes_directory() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let sup = supervisor(&office, config(url.clone(), dir.path()));

        sup.start().await.unwrap();
        sup.stop().await.unwrap();

        assert_eq!(office.terminate_count(), 1);
        assert_eq!(office.live_workers(), 0);
        assert!(!workdir::instance_dir(dir.path(), &url).exists());
    }

    #[tokio::test]
    async fn test_stop_twice_is_idempotent() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let sup = supervisor(&office, config(ConnectUrl::socket(2002), dir.path()));

        sup.start().await.unwrap();
        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert_eq!(office.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_leaves_process_running() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let mut cfg = config(url.clone(), dir.path());
        cfg.keep_alive_on_shutdown = true;
        let sup = supervisor(&office, cfg);

        sup.start().await.unwrap();
        sup.stop().await.unwrap();

        assert_eq!(office.live_workers(), 1);
        assert!(workdir::instance_dir(dir.path(), &url).is_dir());
    }

    async fn await_connected(sup: &ProcessSupervisor) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sup.connection().is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker did not reconnect in time");
    }

    #[tokio::test]
    async fn test_requested_restart_preserves_profile() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let sup = supervisor(&office, config(url.clone(), dir.path()));

        sup.start().await.unwrap();
        let marker = workdir::instance_dir(dir.path(), &url).join("profile.marker");
        std::fs::write(&marker, b"keep me").unwrap();

        sup.request_restart(RestartMode::Requested);
        tokio::time::timeout(Duration::from_secs(5), async {
            while office.spawn_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        await_connected(&sup).await;

        assert!(marker.is_file(), "profile was wiped by a planned restart");
    }

    #[tokio::test]
    async fn test_lost_connection_restart_wipes_profile() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let sup = supervisor(&office, config(url.clone(), dir.path()));

        sup.start().await.unwrap();
        let marker = workdir::instance_dir(dir.path(), &url).join("profile.marker");
        std::fs::write(&marker, b"crash leftovers").unwrap();

        office.crash(&url);
        sup.request_restart(RestartMode::LostConnection);
        tokio::time::timeout(Duration::from_secs(5), async {
            while office.spawn_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        await_connected(&sup).await;

        assert!(!marker.exists(), "crash restart must wipe the profile");
    }

    #[tokio::test]
    async fn test_task_timeout_restart_kills_without_respawn() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let sup = supervisor(&office, config(url.clone(), dir.path()));

        sup.start().await.unwrap();
        sup.request_restart(RestartMode::TaskTimeout);

        tokio::time::timeout(Duration::from_secs(5), async {
            while office.live_workers() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The kill alone spawns nothing; the respawn belongs to the
        // disconnected-event path exercised at the pool-entry level.
        assert_eq!(office.spawn_count(), 1);
        assert_eq!(office.kills().len(), 1);
    }
}
