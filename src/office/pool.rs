//! # OfficePool: N pool entries behind a bounded availability queue.
//!
//! The pool owns its entries for its whole life; entries own supervisors,
//! supervisors own processes. Callers only see
//! [`execute`](OfficePool::execute): acquire an available entry (bounded by
//! the queue timeout), delegate, release.
//!
//! ```text
//! execute(task) ──► acquire (availability queue, ≤ task_queue_timeout)
//!                     │ stale index (entry went unavailable while queued)
//!                     │      └── discarded, keep waiting
//!                     ▼
//!                PoolEntry::execute ──► worker
//!                     ▼
//!                release (re-enqueue iff still available)
//! ```
//!
//! ## Lifecycle
//! `Stopped → Started → Shutdown`, shutdown terminal. `start()` is rejected
//! once started or shut down; `stop()` is idempotent after shutdown, flips
//! the state before doing any work (so no new `execute` is accepted), then
//! gives every entry a best-effort stop and reports the first error.
//!
//! ## Queue membership
//! The availability queue is derived state: an index is live in it iff the
//! entry's `queued` flag is set, and the flag only flips on an availability
//! transition. Entries enqueue themselves on their `connected` events;
//! [`release`](PoolEntry::release) re-enqueues only an entry that is still
//! available. The queue therefore never holds a duplicate.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::error::OfficeError;
use crate::office::entry::PoolEntry;
use crate::task::TaskRef;
use crate::transport::{BridgeTransport, LocalProcessTransport, ProcessTransport, TcpBridge};

const STOPPED: u8 = 0;
const STARTED: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Pool lifecycle state; `Shutdown` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// Created but not started.
    Stopped,
    /// Accepting tasks.
    Started,
    /// Shut down; terminal.
    Shutdown,
}

/// Pool of supervised office worker processes.
///
/// Must be created inside a tokio runtime: construction spawns the per-entry
/// lifecycle and executor tasks.
pub struct OfficePool {
    entries: Vec<Arc<PoolEntry>>,
    available: tokio::sync::Mutex<mpsc::Receiver<usize>>,
    /// Serializes start/stop; `execute` only reads the atomic state.
    lifecycle: tokio::sync::Mutex<()>,
    state: AtomicU8,
    /// Cancelled on shutdown so acquirers waiting on the queue bail out
    /// immediately instead of running out their queue timeout.
    shutdown: CancellationToken,
    queue_timeout: Duration,
    start_fail_fast: bool,
}

impl OfficePool {
    /// Creates a pool over the built-in transports (local processes, TCP
    /// bridge).
    pub fn new(cfg: PoolConfig) -> Result<Self, OfficeError> {
        Self::with_transports(cfg, Arc::new(LocalProcessTransport::new()), Arc::new(TcpBridge::new()))
    }

    /// Creates a pool over explicit transports; this is also the seam test
    /// doubles plug into.
    pub fn with_transports(
        cfg: PoolConfig,
        process: Arc<dyn ProcessTransport>,
        bridge: Arc<dyn BridgeTransport>,
    ) -> Result<Self, OfficeError> {
        cfg.validate()?;

        let size = cfg.pool_size();
        let (sender, receiver) = mpsc::channel(size);
        let entries = cfg
            .connect_urls
            .iter()
            .enumerate()
            .map(|(index, url)| {
                PoolEntry::new(
                    index,
                    &cfg,
                    url.clone(),
                    process.clone(),
                    bridge.clone(),
                    sender.clone(),
                )
            })
            .collect();

        Ok(Self {
            entries,
            available: tokio::sync::Mutex::new(receiver),
            lifecycle: tokio::sync::Mutex::new(()),
            state: AtomicU8::new(STOPPED),
            shutdown: CancellationToken::new(),
            queue_timeout: cfg.task_queue_timeout,
            start_fail_fast: cfg.start_fail_fast,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            STARTED => PoolState::Started,
            SHUTDOWN => PoolState::Shutdown,
            _ => PoolState::Stopped,
        }
    }

    /// True while the pool accepts tasks.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STARTED
    }

    /// Number of workers this pool supervises.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Starts every worker and flips the pool to `Started`.
    ///
    /// With `start_fail_fast` the first worker failure aborts the start,
    /// already-started workers get a best-effort stop, and the error is
    /// returned; otherwise workers start in the background and failures are
    /// logged, with entries joining the availability queue as they connect.
    pub async fn start(&self) -> Result<(), OfficeError> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            PoolState::Started => return Err(OfficeError::AlreadyStarted),
            PoolState::Shutdown => return Err(OfficeError::AlreadyShutdown),
            PoolState::Stopped => {}
        }
        info!(size = self.entries.len(), "starting office pool");

        if self.start_fail_fast {
            for (index, entry) in self.entries.iter().enumerate() {
                if let Err(err) = entry.start().await {
                    error!(index, error = %err, "worker start failed; aborting pool start");
                    // The failing entry is included: a connect-exhausted start
                    // can leave its spawned process alive.
                    for started in &self.entries[..=index] {
                        if let Err(stop_err) = started.stop().await {
                            error!(error = %stop_err, "cleanup stop failed");
                        }
                    }
                    return Err(err);
                }
            }
        } else {
            for entry in &self.entries {
                entry.start_detached();
            }
        }

        self.state.store(STARTED, Ordering::SeqCst);
        Ok(())
    }

    /// Shuts the pool down.
    ///
    /// Idempotent once shut down. Flips the state first so no new `execute`
    /// is accepted, drains the availability queue, then stops every entry —
    /// all of them, even after a failure — and reports the first error.
    pub async fn stop(&self) -> Result<(), OfficeError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == PoolState::Shutdown {
            return Ok(());
        }
        self.state.store(SHUTDOWN, Ordering::SeqCst);
        // Waiting acquirers hold the queue mutex across their recv; wake
        // them first or the drain below waits out their queue timeouts.
        self.shutdown.cancel();
        info!("stopping office pool");

        {
            let mut available = self.available.lock().await;
            while available.try_recv().is_ok() {}
        }

        let mut first_error = None;
        for entry in &self.entries {
            if let Err(err) = entry.stop().await {
                error!(index = entry.index(), error = %err, "entry stop failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs one task against the first worker to become available.
    ///
    /// Waits up to the queue timeout for an entry, then up to the execution
    /// timeout for the task. The entry is always released afterwards; whether
    /// it actually re-enters the queue is decided by its own availability.
    pub async fn execute(&self, task: TaskRef) -> Result<(), OfficeError> {
        match self.state() {
            PoolState::Started => {}
            PoolState::Stopped => return Err(OfficeError::NotStarted),
            PoolState::Shutdown => return Err(OfficeError::AlreadyShutdown),
        }

        let entry = match tokio::time::timeout(self.queue_timeout, self.acquire()).await {
            Ok(acquired) => acquired?,
            Err(_) => {
                return Err(OfficeError::NoEntryAvailable {
                    timeout: self.queue_timeout,
                })
            }
        };

        let result = entry.execute(task).await;
        entry.release();
        result
    }

    /// Takes the next genuinely available entry off the queue.
    async fn acquire(&self) -> Result<Arc<PoolEntry>, OfficeError> {
        loop {
            let index = {
                let mut available = self.available.lock().await;
                tokio::select! {
                    index = available.recv() => index,
                    _ = self.shutdown.cancelled() => return Err(OfficeError::AlreadyShutdown),
                }
            };
            match index {
                Some(index) => {
                    let entry = self.entries[index].clone();
                    entry.mark_dequeued();
                    if entry.is_available() {
                        return Ok(entry);
                    }
                    // Went unavailable while queued (crash); its next
                    // connected event re-enqueues it.
                    debug!(index, "discarding stale availability token");
                }
                None => return Err(OfficeError::AlreadyShutdown),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExistingProcessAction;
    use crate::error::TaskError;
    use crate::office::workdir;
    use crate::task::{OfficeTaskFn, TaskContext};
    use crate::transport::{ConnectUrl, MockOffice};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use tempfile::tempdir;
    use tokio::time::sleep;

    fn test_config(ports: &[u16], working_dir: &Path) -> PoolConfig {
        PoolConfig {
            working_dir: working_dir.to_path_buf(),
            office_home: "/opt/office".into(),
            process_timeout: Duration::from_secs(5),
            process_retry_interval: Duration::from_millis(10),
            task_execution_timeout: Duration::from_secs(5),
            task_queue_timeout: Duration::from_secs(2),
            max_tasks_per_process: 0,
            start_fail_fast: true,
            ..PoolConfig::with_ports(ports)
        }
    }

    fn pool_with(office: &MockOffice, cfg: PoolConfig) -> Arc<OfficePool> {
        Arc::new(
            OfficePool::with_transports(cfg, Arc::new(office.clone()), Arc::new(office.clone()))
                .unwrap(),
        )
    }

    fn ok_task(counter: Arc<AtomicU32>) -> TaskRef {
        OfficeTaskFn::arc("count", move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Sleeps cooperatively; reports `Cancelled` when abandoned.
    fn sleep_task(duration: Duration) -> TaskRef {
        OfficeTaskFn::arc("sleep", move |ctx: TaskContext| async move {
            tokio::select! {
                _ = sleep(duration) => Ok(()),
                _ = ctx.cancellation().cancelled() => Err(TaskError::Cancelled),
            }
        })
    }

    async fn await_available(pool: &OfficePool, index: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pool.entries[index].is_available() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("entry did not become available in time");
    }

    #[tokio::test]
    async fn test_execute_rejected_before_start() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));

        let err = pool.execute(ok_task(Arc::default())).await.unwrap_err();
        assert!(matches!(err, OfficeError::NotStarted));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));

        pool.start().await.unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, OfficeError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));

        pool.start().await.unwrap();
        pool.stop().await.unwrap();

        assert!(matches!(pool.start().await, Err(OfficeError::AlreadyShutdown)));
        assert!(matches!(
            pool.execute(ok_task(Arc::default())).await,
            Err(OfficeError::AlreadyShutdown)
        ));
        assert_eq!(pool.state(), PoolState::Shutdown);
    }

    #[tokio::test]
    async fn test_stop_twice_never_raises() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002, 2003], dir.path()));

        pool.start().await.unwrap();
        pool.stop().await.unwrap();
        pool.stop().await.unwrap();
        assert_eq!(office.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_stop_releases_waiting_callers() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&[2002], dir.path());
        cfg.task_queue_timeout = Duration::from_secs(30);
        cfg.task_execution_timeout = Duration::from_secs(30);
        let pool = pool_with(&office, cfg);
        pool.start().await.unwrap();

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(sleep_task(Duration::from_secs(30))).await })
        };
        sleep(Duration::from_millis(50)).await;
        // Second caller parks on the availability queue behind the busy entry.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(ok_task(Arc::default())).await })
        };
        sleep(Duration::from_millis(50)).await;

        // Shutdown must not wait out the queued caller's 30s queue timeout.
        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .expect("stop stalled behind a queued caller")
            .unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(OfficeError::AlreadyShutdown)
        ));
        match slow.await.unwrap() {
            Err(OfficeError::Task { source }) => assert!(matches!(source, TaskError::Cancelled)),
            other => panic!("expected cancelled in-flight task, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_stop_leaves_nothing_behind() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002, 2003], dir.path()));

        pool.start().await.unwrap();
        assert_eq!(office.live_workers(), 2);

        pool.stop().await.unwrap();
        assert_eq!(office.live_workers(), 0);
        for port in [2002, 2003] {
            let instance = workdir::instance_dir(dir.path(), &ConnectUrl::socket(port));
            assert!(!instance.exists(), "leftover directory {instance:?}");
        }
    }

    #[tokio::test]
    async fn test_fail_fast_start_surfaces_existing_process() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        office.seed_worker(&url, true);

        let mut cfg = test_config(&[2002], dir.path());
        cfg.existing_process_action = ExistingProcessAction::Fail;
        let pool = pool_with(&office, cfg);

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, OfficeError::ExistingProcess { .. }));
        assert!(office.kills().is_empty());
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_fail_fast_start_stops_failing_worker() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        // The worker spawns fine but never accepts a handshake, so the start
        // fails by connect exhaustion with the process still alive.
        office.refuse_opens(10_000);

        let mut cfg = test_config(&[2002], dir.path());
        cfg.process_timeout = Duration::from_millis(200);
        let pool = pool_with(&office, cfg);

        pool.start().await.unwrap_err();
        assert_eq!(office.spawn_count(), 1);
        assert_eq!(office.live_workers(), 0, "failed start leaked a live worker");
    }

    #[tokio::test]
    async fn test_execute_runs_tasks() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));
        pool.start().await.unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        pool.execute(ok_task(counter.clone())).await.unwrap();
        pool.execute(ok_task(counter.clone())).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_task_error_is_unwrapped() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));
        pool.start().await.unwrap();

        let failing: TaskRef = OfficeTaskFn::arc("fail", |_ctx: TaskContext| async {
            Err(TaskError::Fail {
                error: "document is corrupt".to_string(),
            })
        });
        let err = pool.execute(failing).await.unwrap_err();
        match err {
            OfficeError::Task { source } => {
                assert!(source.to_string().contains("document is corrupt"));
            }
            other => panic!("expected Task error, got {other}"),
        }

        // The worker is not restarted for a task-level failure.
        assert_eq!(office.spawn_count(), 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_availability_matches_queue_membership() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002, 2003], dir.path()));
        pool.start().await.unwrap();

        for entry in &pool.entries {
            assert!(entry.is_available());
            assert!(entry.is_queued());
        }

        pool.execute(ok_task(Arc::default())).await.unwrap();
        // Release has re-enqueued the entry exactly once.
        for entry in &pool.entries {
            assert_eq!(entry.is_available(), entry.is_queued());
        }

        pool.stop().await.unwrap();
        for entry in &pool.entries {
            assert!(!entry.is_available());
        }
    }

    #[tokio::test]
    async fn test_at_most_one_task_per_entry() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));
        pool.start().await.unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut callers = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            callers.push(tokio::spawn(async move {
                let task: TaskRef = OfficeTaskFn::arc("overlap-probe", move |_ctx: TaskContext| {
                    let in_flight = in_flight.clone();
                    let overlaps = overlaps.clone();
                    async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                pool.execute(task).await
            }));
        }
        for caller in callers {
            caller.await.unwrap().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_recycles_after_three_tasks() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&[2002], dir.path());
        cfg.max_tasks_per_process = 3;
        let pool = pool_with(&office, cfg);
        pool.start().await.unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            pool.execute(ok_task(counter.clone())).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        // The count reset exactly once, after exactly three completions.
        assert_eq!(pool.entries[0].task_count(), 1);
        assert_eq!(office.spawn_count(), 2);
        // The quota restart was the graceful kind.
        assert_eq!(office.terminate_count(), 1);

        pool.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_restarts_worker() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&[2002], dir.path());
        cfg.task_execution_timeout = Duration::from_millis(1500);
        let pool = pool_with(&office, cfg);
        pool.start().await.unwrap();

        let err = pool.execute(sleep_task(Duration::from_millis(2000))).await.unwrap_err();
        assert!(matches!(err, OfficeError::TaskTimeout { .. }));
        assert!(err.to_string().contains("1500"));
        // The condemned worker must not be offered to the next caller while
        // the kill is still in flight.
        assert!(!pool.entries[0].is_available());

        // Recovery is transparent: the next task succeeds on a fresh worker.
        let counter = Arc::new(AtomicU32::new(0));
        pool.execute(ok_task(counter.clone())).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(office.spawn_count(), 2);

        pool.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_fails_fast() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&[2002], dir.path());
        cfg.task_queue_timeout = Duration::from_millis(1000);
        let pool = pool_with(&office, cfg);
        pool.start().await.unwrap();

        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(sleep_task(Duration::from_millis(2000))).await })
        };
        sleep(Duration::from_millis(250)).await;

        let err = pool
            .execute(sleep_task(Duration::from_millis(1500)))
            .await
            .unwrap_err();
        assert!(matches!(err, OfficeError::NoEntryAvailable { .. }));
        assert!(err.to_string().contains("1000"));

        // The first task is unaffected.
        slow.await.unwrap().unwrap();
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_mid_task_recovers_without_caller() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let pool = pool_with(&office, test_config(&[2002], dir.path()));
        pool.start().await.unwrap();

        let url = ConnectUrl::socket(2002);
        let caller = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(sleep_task(Duration::from_secs(30))).await })
        };
        // Let the task reach the worker, then crash it underneath.
        sleep(Duration::from_millis(50)).await;
        office.crash(&url);

        let err = caller.await.unwrap().unwrap_err();
        match err {
            OfficeError::Task { source } => assert!(matches!(source, TaskError::Cancelled)),
            other => panic!("expected cancelled task, got {other}"),
        }

        // The entry recovers on its own and serves the next task.
        await_available(&pool, 0).await;
        let counter = Arc::new(AtomicU32::new(0));
        pool.execute(ok_task(counter.clone())).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(office.spawn_count(), 2);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_start_becomes_available() {
        let office = MockOffice::new();
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&[2002], dir.path());
        cfg.start_fail_fast = false;
        let pool = pool_with(&office, cfg);

        pool.start().await.unwrap();
        assert!(pool.is_running());

        // Workers connect in the background; execute waits on the queue.
        let counter = Arc::new(AtomicU32::new(0));
        pool.execute(ok_task(counter.clone())).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        pool.stop().await.unwrap();
    }
}
