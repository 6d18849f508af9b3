//! # Scriptable in-memory office, for tests and downstream development.
//!
//! [`MockOffice`] implements both transport seams over one shared state table,
//! so the coupling real deployments get from the OS falls out naturally:
//! killing a mock worker disposes its bridge sessions, a worker that has not
//! been spawned refuses connections, and `find_pid` only sees live workers.
//!
//! The mock ships un-gated so downstream crates can drive a full pool in their
//! own tests without a worker installation.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::OfficeError;
use crate::transport::{
    BridgeError, BridgeSession, BridgeTransport, ConnectUrl, PidStatus, ProcessQuery,
    ProcessTransport, WorkerCommand, WorkerProcess,
};

/// Exit code recorded for mock workers that are killed.
const EXIT_KILLED: i32 = 137;

/// Exit code recorded for mock workers that crash.
const EXIT_CRASHED: i32 = 139;

/// One simulated worker process.
struct MockWorker {
    pid: u32,
    accept: String,
    exit: Option<i32>,
    accepting: bool,
    sessions: Vec<CancellationToken>,
}

impl MockWorker {
    fn dispose_sessions(&mut self) {
        for session in self.sessions.drain(..) {
            session.cancel();
        }
    }
}

#[derive(Default)]
struct MockState {
    workers: Vec<MockWorker>,
    next_pid: u32,
    spawns: usize,
    kills: Vec<u32>,
    terminates: usize,
    open_attempts: usize,
    refuse_opens: usize,
    exit_81_spawns: usize,
    fail_spawns: bool,
}

impl MockState {
    fn live_by_accept(&mut self, accept: &str) -> Option<&mut MockWorker> {
        self.workers
            .iter_mut()
            .find(|w| w.accept == accept && w.exit.is_none())
    }

    fn by_pid(&mut self, pid: u32) -> Option<&mut MockWorker> {
        self.workers.iter_mut().find(|w| w.pid == pid)
    }
}

/// In-memory office installation implementing both transport seams.
///
/// Clone it twice and hand one clone to each transport slot of
/// [`OfficePool::with_transports`](crate::OfficePool::with_transports); all
/// clones share the same worker table.
#[derive(Clone, Default)]
pub struct MockOffice {
    state: Arc<Mutex<MockState>>,
}

impl MockOffice {
    /// Creates an empty mock office.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a worker that was "already running" before any pool started,
    /// for exercising the existing-process policies.
    pub fn seed_worker(&self, url: &ConnectUrl, accepting: bool) -> u32 {
        let mut state = self.state();
        state.next_pid += 1;
        let pid = 9000 + state.next_pid;
        state.workers.push(MockWorker {
            pid,
            accept: url.accept_string(),
            exit: None,
            accepting,
            sessions: Vec::new(),
        });
        debug!("[MOCK] seeded existing worker pid {} for {}", pid, url);
        pid
    }

    /// Crashes the live worker serving `url`: marks it exited and disposes
    /// every open session, exactly as a real segfault would.
    pub fn crash(&self, url: &ConnectUrl) {
        let mut state = self.state();
        if let Some(worker) = state.live_by_accept(&url.accept_string()) {
            debug!("[MOCK] crashing worker pid {}", worker.pid);
            worker.exit = Some(EXIT_CRASHED);
            worker.dispose_sessions();
        }
    }

    /// Refuses the next `n` bridge handshakes even against live workers.
    pub fn refuse_opens(&self, n: usize) {
        self.state().refuse_opens = n;
    }

    /// Makes the next `n` spawned workers exit immediately with the
    /// needs-reinitialization code (81) instead of accepting connections.
    pub fn exit_81_on_spawns(&self, n: usize) {
        self.state().exit_81_spawns = n;
    }

    /// Makes every spawn attempt fail outright.
    pub fn fail_spawns(&self, fail: bool) {
        self.state().fail_spawns = fail;
    }

    /// Number of workers spawned through the transport so far.
    pub fn spawn_count(&self) -> usize {
        self.state().spawns
    }

    /// PIDs that received a hard kill, in order.
    pub fn kills(&self) -> Vec<u32> {
        self.state().kills.clone()
    }

    /// Number of graceful terminations requested over the bridge.
    pub fn terminate_count(&self) -> usize {
        self.state().terminates
    }

    /// Number of bridge handshake attempts so far.
    pub fn open_attempts(&self) -> usize {
        self.state().open_attempts
    }

    /// Number of workers currently alive.
    pub fn live_workers(&self) -> usize {
        self.state().workers.iter().filter(|w| w.exit.is_none()).count()
    }
}

#[async_trait]
impl ProcessTransport for MockOffice {
    async fn spawn(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, OfficeError> {
        let mut state = self.state();
        if state.fail_spawns {
            return Err(OfficeError::Start {
                message: "spawn refused by mock".to_string(),
            });
        }
        state.next_pid += 1;
        state.spawns += 1;
        let pid = state.next_pid;

        let reinitialize = state.exit_81_spawns > 0;
        if reinitialize {
            state.exit_81_spawns -= 1;
        }
        state.workers.push(MockWorker {
            pid,
            accept: command.accept.clone(),
            exit: reinitialize.then_some(81),
            accepting: !reinitialize,
            sessions: Vec::new(),
        });
        debug!("[MOCK] spawned worker pid {} (reinitialize: {})", pid, reinitialize);

        Ok(Box::new(MockWorkerProcess {
            pid,
            office: self.clone(),
        }))
    }

    async fn find_pid(&self, query: &ProcessQuery) -> Result<PidStatus, OfficeError> {
        let mut state = self.state();
        Ok(match state.live_by_accept(&query.argument) {
            Some(worker) => PidStatus::Found(worker.pid),
            None => PidStatus::NotFound,
        })
    }

    async fn kill(&self, pid: u32) -> Result<(), OfficeError> {
        let mut state = self.state();
        state.kills.push(pid);
        if let Some(worker) = state.by_pid(pid) {
            if worker.exit.is_none() {
                debug!("[MOCK] killed worker pid {}", pid);
                worker.exit = Some(EXIT_KILLED);
                worker.dispose_sessions();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeTransport for MockOffice {
    async fn open(&self, url: &ConnectUrl) -> Result<Arc<dyn BridgeSession>, BridgeError> {
        let mut state = self.state();
        state.open_attempts += 1;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(BridgeError::Rejected {
                message: "handshake refused by mock".to_string(),
            });
        }

        let accept = url.accept_string();
        match state.live_by_accept(&accept) {
            Some(worker) if worker.accepting => {
                let token = CancellationToken::new();
                worker.sessions.push(token.clone());
                let pid = worker.pid;
                debug!("[MOCK] opened session to worker pid {}", pid);
                Ok(Arc::new(MockSession {
                    pid,
                    token,
                    office: self.clone(),
                }))
            }
            _ => Err(BridgeError::Rejected {
                message: format!("no acceptor on {url}"),
            }),
        }
    }
}

/// Handle to one mock worker process.
struct MockWorkerProcess {
    pid: u32,
    office: MockOffice,
}

#[async_trait]
impl WorkerProcess for MockWorkerProcess {
    fn pid(&self) -> PidStatus {
        PidStatus::Found(self.pid)
    }

    async fn exit_code(&self) -> Option<i32> {
        self.office.state().by_pid(self.pid).and_then(|w| w.exit)
    }
}

/// One session against a mock worker.
struct MockSession {
    pid: u32,
    token: CancellationToken,
    office: MockOffice,
}

#[async_trait]
impl BridgeSession for MockSession {
    fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn disposed(&self) {
        self.token.cancelled().await;
    }

    async fn terminate(&self) -> Result<(), BridgeError> {
        let mut state = self.office.state();
        match state.by_pid(self.pid) {
            Some(worker) if worker.exit.is_none() => {
                debug!("[MOCK] worker pid {} terminating gracefully", self.pid);
                worker.exit = Some(0);
                worker.dispose_sessions();
            }
            _ => return Err(BridgeError::Disposed),
        }
        state.terminates += 1;
        Ok(())
    }

    fn close(&self) {
        self.token.cancel();
    }
}
