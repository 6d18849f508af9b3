//! # PoolEntry: one worker's task executor and availability logic.
//!
//! Wraps one [`ProcessSupervisor`] and serializes task execution against its
//! worker through a dedicated, *suspendable* executor task: before each job
//! the executor waits on the availability gate, so no task ever runs against
//! a worker that is mid-restart.
//!
//! ```text
//! execute(task) ── Job{task, token, reply} ──► ┌───────────────┐
//!                                              │ executor loop │ gate.wait_for(available)
//!                                              └───────┬───────┘
//!                                                      ▼
//!                                            task.execute(ctx)
//!
//! connected    ──► task_count = 0, gate ← true,  enqueue into the pool
//! disconnected ──► gate ← false; expected? consume flag : cancel task,
//!                                                         restart(LostConnection)
//! ```
//!
//! ## Rules
//! - `expect_disconnect` is armed **before** the operation that causes the
//!   disposal (quota restart, shutdown), never after; this is what keeps a
//!   planned restart from being misclassified as a crash.
//! - The entry re-enters the pool's availability queue once per transition to
//!   available (guarded by the `queued` CAS), never once per `execute` call.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::{OfficeConnection, WeakListener};
use crate::error::{OfficeError, TaskError};
use crate::events::{ConnectionEvent, ConnectionEventListener};
use crate::office::supervisor::{ProcessSupervisor, RestartMode};
use crate::task::{TaskContext, TaskRef};
use crate::transport::{BridgeTransport, ConnectUrl, ProcessTransport};

struct Job {
    task: TaskRef,
    token: CancellationToken,
    reply: oneshot::Sender<Result<(), TaskError>>,
}

/// One worker's supervising unit inside the pool.
pub(crate) struct PoolEntry {
    index: usize,
    supervisor: ProcessSupervisor,
    quota: Option<u32>,
    execution_timeout: Duration,
    /// Tasks completed by the current worker instance; resets on connect.
    task_count: AtomicU32,
    /// The availability gate the executor loop waits on.
    gate: watch::Sender<bool>,
    /// True while this entry's index sits in the pool's availability queue.
    queued: AtomicBool,
    /// Armed before a planned disposal so the event is not treated as a crash.
    expect_disconnect: AtomicBool,
    current_task: Mutex<Option<CancellationToken>>,
    jobs: mpsc::Sender<Job>,
    availability: mpsc::Sender<usize>,
}

impl PoolEntry {
    /// Builds the entry, registers it on the connection, and spawns its
    /// executor loop.
    pub(crate) fn new(
        index: usize,
        cfg: &PoolConfig,
        url: ConnectUrl,
        process: Arc<dyn ProcessTransport>,
        bridge: Arc<dyn BridgeTransport>,
        availability: mpsc::Sender<usize>,
    ) -> Arc<Self> {
        let supervisor = ProcessSupervisor::new(cfg.process_config(url), process, bridge);
        let (gate, gate_receiver) = watch::channel(false);
        let (jobs, jobs_receiver) = mpsc::channel(1);

        let entry = Arc::new(Self {
            index,
            supervisor,
            quota: cfg.task_quota(),
            execution_timeout: cfg.task_execution_timeout,
            task_count: AtomicU32::new(0),
            gate,
            queued: AtomicBool::new(false),
            expect_disconnect: AtomicBool::new(false),
            current_task: Mutex::new(None),
            jobs,
            availability,
        });

        entry
            .supervisor
            .connection()
            .add_listener(Arc::new(WeakListener(Arc::downgrade(&entry))));
        tokio::spawn(executor_loop(
            jobs_receiver,
            gate_receiver,
            entry.supervisor.connection().clone(),
        ));
        entry
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Tasks completed by the current worker instance.
    pub(crate) fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_available(&self) -> bool {
        *self.gate.borrow()
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    pub(crate) async fn start(&self) -> Result<(), OfficeError> {
        self.expect_disconnect.store(false, Ordering::SeqCst);
        self.supervisor.start().await
    }

    pub(crate) fn start_detached(&self) {
        self.expect_disconnect.store(false, Ordering::SeqCst);
        self.supervisor.start_detached();
    }

    /// Stops the worker; outstanding work is cancelled, the disposal is
    /// marked expected so no crash recovery fires.
    ///
    /// The flag stays armed afterwards: the disposal event may arrive after
    /// `stop` returns, and the next `start` disarms it anyway.
    pub(crate) async fn stop(&self) -> Result<(), OfficeError> {
        self.set_available(false);
        self.expect_disconnect.store(true, Ordering::SeqCst);
        if let Some(token) = self.current_task_slot().take() {
            token.cancel();
        }
        self.supervisor.stop().await
    }

    /// Runs one task against this entry's worker, bounded by the execution
    /// timeout.
    pub(crate) async fn execute(&self, task: TaskRef) -> Result<(), OfficeError> {
        let token = CancellationToken::new();
        let (reply, outcome) = oneshot::channel();
        *self.current_task_slot() = Some(token.clone());

        let job = Job {
            task,
            token: token.clone(),
            reply,
        };
        if self.jobs.send(job).await.is_err() {
            self.current_task_slot().take();
            return Err(OfficeError::TaskInterrupted);
        }

        let result = match tokio::time::timeout(self.execution_timeout, outcome).await {
            Ok(Ok(Ok(()))) => {
                self.on_task_success();
                Ok(())
            }
            Ok(Ok(Err(source))) => Err(OfficeError::Task { source }),
            Ok(Err(_)) => Err(OfficeError::TaskInterrupted),
            Err(_) => {
                warn!(
                    url = %self.supervisor.connection().url(),
                    timeout_ms = self.execution_timeout.as_millis() as u64,
                    "task timed out; forcing worker restart"
                );
                // Close the gate before the kill lands so release() cannot
                // hand the condemned worker to the next caller.
                self.set_available(false);
                token.cancel();
                self.supervisor.request_restart(RestartMode::TaskTimeout);
                Err(OfficeError::TaskTimeout {
                    timeout: self.execution_timeout,
                })
            }
        };
        self.current_task_slot().take();
        result
    }

    /// Pool-side: the entry's index was taken off the availability queue.
    pub(crate) fn mark_dequeued(&self) {
        self.queued.store(false, Ordering::SeqCst);
    }

    /// Pool-side: task finished, give the entry back. Only re-enqueues an
    /// entry that is still available; an unavailable one re-enters via its
    /// next `connected` event instead.
    pub(crate) fn release(&self) {
        if self.is_available() {
            self.enqueue();
        }
    }

    fn on_task_success(&self) {
        let count = self.task_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(quota) = self.quota {
            if count >= quota {
                debug!(
                    url = %self.supervisor.connection().url(),
                    count,
                    "task quota reached; recycling worker"
                );
                self.set_available(false);
                // Armed before the stop that causes the disposal.
                self.expect_disconnect.store(true, Ordering::SeqCst);
                self.supervisor.request_restart(RestartMode::Requested);
            }
        }
    }

    fn set_available(&self, available: bool) {
        self.gate.send_replace(available);
    }

    /// One enqueue per availability transition, never a duplicate.
    fn enqueue(&self) {
        if self
            .queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Capacity equals the pool size, so with the CAS held this only
            // fails once the pool has shut down and dropped the receiver.
            if self.availability.try_send(self.index).is_err() {
                self.queued.store(false, Ordering::SeqCst);
            }
        }
    }

    fn current_task_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        match self.current_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConnectionEventListener for PoolEntry {
    fn connected(&self, event: &ConnectionEvent) {
        self.task_count.store(0, Ordering::SeqCst);
        debug!(url = %event.url(), "worker connected; entry available");
        self.set_available(true);
        self.enqueue();
    }

    fn disconnected(&self, event: &ConnectionEvent) {
        self.set_available(false);
        if self.expect_disconnect.swap(false, Ordering::SeqCst) {
            debug!(url = %event.url(), "planned disconnection; restart already in flight");
            return;
        }
        warn!(url = %event.url(), "connection lost unexpectedly; recovering");
        if let Some(token) = self.current_task_slot().take() {
            token.cancel();
        }
        self.supervisor.request_restart(RestartMode::LostConnection);
    }
}

/// The entry's dedicated single-consumer executor: at most one task runs
/// against the worker at a time, and none while the entry is unavailable.
async fn executor_loop(
    mut jobs: mpsc::Receiver<Job>,
    mut gate: watch::Receiver<bool>,
    connection: Arc<OfficeConnection>,
) {
    while let Some(job) = jobs.recv().await {
        // Suspend: hold the job until the entry is available, unless the job
        // is cancelled while waiting (timeout or shutdown).
        tokio::select! {
            open = gate.wait_for(|available| *available) => {
                if open.is_err() {
                    let _ = job.reply.send(Err(TaskError::Cancelled));
                    break;
                }
            }
            _ = job.token.cancelled() => {
                let _ = job.reply.send(Err(TaskError::Cancelled));
                continue;
            }
        }

        let ctx = TaskContext::new(
            connection.url().clone(),
            connection.clone(),
            job.token.clone(),
        );
        debug!(url = %connection.url(), task = job.task.name(), "executing task");
        let result = tokio::select! {
            result = job.task.execute(ctx) => result,
            _ = job.token.cancelled() => Err(TaskError::Cancelled),
        };
        let _ = job.reply.send(result);
    }
}
