//! # Pool and per-worker configuration.
//!
//! Provides [`PoolConfig`] (one per pool) and [`ProcessConfig`] (one per
//! worker, derived from the pool config and a single connect URL).
//!
//! Config is used in two ways:
//! 1. **Pool creation**: `OfficePool::new(config)` validates and consumes it.
//! 2. **Worker derivation**: `config.process_config(url)` slices out the
//!    per-worker view handed to each supervisor.
//!
//! ## Sentinel values
//! - `max_tasks_per_process = 0` → unlimited (no quota restart)
//! - `after_start_delay = 0s` → connect immediately after spawn

use std::path::PathBuf;
use std::time::Duration;

use crate::error::OfficeError;
use crate::transport::ConnectUrl;

/// Policy applied when a worker already occupies the target address at start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExistingProcessAction {
    /// Refuse to start; the caller gets
    /// [`OfficeError::ExistingProcess`](crate::OfficeError::ExistingProcess).
    Fail,
    /// Kill the occupant, wait for it to vanish, then spawn fresh.
    #[default]
    Kill,
    /// Attach to the occupant instead of spawning; its working directory and
    /// lifetime stay foreign.
    Connect,
    /// Try [`Connect`](ExistingProcessAction::Connect) first and fall back to
    /// [`Kill`](ExistingProcessAction::Kill) + spawn when the handshake fails.
    ConnectOrKill,
}

/// Configuration for one [`OfficePool`](crate::OfficePool).
///
/// Defines:
/// - **Pool shape**: one worker per entry in `connect_urls`
/// - **Worker environment**: office home, working directory root, run-as
///   wrapper, template profile
/// - **Lifecycle timing**: process timeout/retry interval, after-start delay
/// - **Task scheduling**: execution timeout, per-process quota, queue timeout
///
/// ## Field semantics
/// - `max_tasks_per_process`: quota before a planned restart (`0` = unlimited)
/// - `keep_alive_on_shutdown`: disconnect only, leave processes running
/// - `start_fail_fast`: `true` = `start()` waits for every worker and surfaces
///   the first failure; `false` = fire-and-forget, failures are logged
///
/// All fields are public; prefer the helper accessors over sprinkling sentinel
/// checks across call sites.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Addresses the workers accept bridge connections on; the pool size is
    /// the number of entries here.
    pub connect_urls: Vec<ConnectUrl>,

    /// Office installation directory (the one containing `program/`).
    pub office_home: PathBuf,

    /// Root under which each worker gets its own instance directory, named
    /// deterministically from its connect URL.
    pub working_dir: PathBuf,

    /// Wrapper command prepended to the worker invocation (sudo-style).
    /// Empty = run the office binary directly.
    pub run_as_args: Vec<String>,

    /// Profile directory copied into each fresh instance directory before
    /// spawn. `None` = let the worker create a default profile.
    pub template_profile_dir: Option<PathBuf>,

    /// Policy for a worker already occupying a target address at start.
    pub existing_process_action: ExistingProcessAction,

    /// Overall budget for each process lifecycle operation (waiting for a
    /// spawn to accept connections, waiting for an exit).
    pub process_timeout: Duration,

    /// Pause between attempts inside a lifecycle retry loop.
    pub process_retry_interval: Duration,

    /// Pause between spawning a worker and the first connect attempt.
    pub after_start_delay: Duration,

    /// Budget for one task execution; overrun forces a worker restart and
    /// raises [`OfficeError::TaskTimeout`](crate::OfficeError::TaskTimeout).
    pub task_execution_timeout: Duration,

    /// Tasks served by one worker instance before a planned restart.
    ///
    /// - `0` = unlimited (the worker is never recycled)
    /// - `n > 0` = restart after the n-th completed task
    pub max_tasks_per_process: u32,

    /// How long [`execute`](crate::OfficePool::execute) waits for a worker to
    /// become available before failing with
    /// [`OfficeError::NoEntryAvailable`](crate::OfficeError::NoEntryAvailable).
    pub task_queue_timeout: Duration,

    /// On shutdown, only disconnect; leave worker processes (and their
    /// instance directories) in place.
    pub keep_alive_on_shutdown: bool,

    /// Surface worker start failures synchronously from `start()` instead of
    /// logging them and letting recovery continue in the background.
    pub start_fail_fast: bool,
}

impl PoolConfig {
    /// Builds a config with one loopback socket URL per port.
    ///
    /// # Example
    /// ```
    /// use officevisor::PoolConfig;
    ///
    /// let cfg = PoolConfig::with_ports(&[2002, 2003]);
    /// assert_eq!(cfg.connect_urls.len(), 2);
    /// ```
    pub fn with_ports(ports: &[u16]) -> Self {
        Self {
            connect_urls: ports.iter().map(|&port| ConnectUrl::socket(port)).collect(),
            ..Self::default()
        }
    }

    /// Returns the task quota as an `Option`.
    ///
    /// - `None` → unlimited (no quota restart)
    /// - `Some(n)` → restart after `n` completed tasks
    #[inline]
    pub fn task_quota(&self) -> Option<u32> {
        if self.max_tasks_per_process == 0 {
            None
        } else {
            Some(self.max_tasks_per_process)
        }
    }

    /// Number of workers this pool will supervise.
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.connect_urls.len()
    }

    /// Slices out the per-worker view for the supervisor owning `url`.
    pub fn process_config(&self, url: ConnectUrl) -> ProcessConfig {
        ProcessConfig {
            url,
            office_home: self.office_home.clone(),
            working_dir: self.working_dir.clone(),
            run_as_args: self.run_as_args.clone(),
            template_profile_dir: self.template_profile_dir.clone(),
            existing_process_action: self.existing_process_action,
            process_timeout: self.process_timeout,
            process_retry_interval: self.process_retry_interval,
            after_start_delay: self.after_start_delay,
            keep_alive_on_shutdown: self.keep_alive_on_shutdown,
        }
    }

    /// Validates the configuration at pool construction time.
    ///
    /// Rejects an empty URL list, duplicate URLs (two workers must never share
    /// an acceptor or an instance directory), and zero timeouts/intervals that
    /// would turn the retry loops into busy spins or instant failures.
    pub fn validate(&self) -> Result<(), OfficeError> {
        if self.connect_urls.is_empty() {
            return Err(OfficeError::InvalidConfig {
                message: "connect_urls must name at least one worker address".to_string(),
            });
        }
        for (i, url) in self.connect_urls.iter().enumerate() {
            if self.connect_urls[..i].contains(url) {
                return Err(OfficeError::InvalidConfig {
                    message: format!("duplicate worker address '{url}'"),
                });
            }
        }
        if self.process_timeout.is_zero() {
            return Err(OfficeError::InvalidConfig {
                message: "process_timeout must be greater than zero".to_string(),
            });
        }
        if self.process_retry_interval.is_zero() {
            return Err(OfficeError::InvalidConfig {
                message: "process_retry_interval must be greater than zero".to_string(),
            });
        }
        if self.process_retry_interval > self.process_timeout {
            return Err(OfficeError::InvalidConfig {
                message: "process_retry_interval must not exceed process_timeout".to_string(),
            });
        }
        if self.task_execution_timeout.is_zero() {
            return Err(OfficeError::InvalidConfig {
                message: "task_execution_timeout must be greater than zero".to_string(),
            });
        }
        if self.task_queue_timeout.is_zero() {
            return Err(OfficeError::InvalidConfig {
                message: "task_queue_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    /// Default configuration:
    ///
    /// - one worker on `127.0.0.1:2002`
    /// - `office_home = /usr/lib/libreoffice`, `working_dir = <system temp>`
    /// - `existing_process_action = Kill`
    /// - `process_timeout = 120s`, `process_retry_interval = 250ms`
    /// - `task_execution_timeout = 120s`, `task_queue_timeout = 30s`
    /// - `max_tasks_per_process = 200`
    fn default() -> Self {
        Self {
            connect_urls: vec![ConnectUrl::socket(2002)],
            office_home: PathBuf::from("/usr/lib/libreoffice"),
            working_dir: std::env::temp_dir(),
            run_as_args: Vec::new(),
            template_profile_dir: None,
            existing_process_action: ExistingProcessAction::default(),
            process_timeout: Duration::from_secs(120),
            process_retry_interval: Duration::from_millis(250),
            after_start_delay: Duration::ZERO,
            task_execution_timeout: Duration::from_secs(120),
            max_tasks_per_process: 200,
            task_queue_timeout: Duration::from_secs(30),
            keep_alive_on_shutdown: false,
            start_fail_fast: false,
        }
    }
}

/// Immutable per-worker slice of the pool configuration.
///
/// Owned by one [`ProcessSupervisor`](crate::ProcessSupervisor); never shared
/// and never mutated after construction.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Address this worker accepts bridge connections on.
    pub url: ConnectUrl,
    /// Office installation directory.
    pub office_home: PathBuf,
    /// Root for this worker's instance directory.
    pub working_dir: PathBuf,
    /// Wrapper command prepended to the invocation.
    pub run_as_args: Vec<String>,
    /// Profile template seeded into a fresh instance directory.
    pub template_profile_dir: Option<PathBuf>,
    /// Policy for an address occupant found at start.
    pub existing_process_action: ExistingProcessAction,
    /// Budget per lifecycle retry loop.
    pub process_timeout: Duration,
    /// Pause between lifecycle retry attempts.
    pub process_retry_interval: Duration,
    /// Pause between spawn and first connect attempt.
    pub after_start_delay: Duration,
    /// On stop, disconnect only and leave the process running.
    pub keep_alive_on_shutdown: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_urls_rejected() {
        let cfg = PoolConfig {
            connect_urls: Vec::new(),
            ..PoolConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, OfficeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_duplicate_urls_rejected() {
        let cfg = PoolConfig::with_ports(&[2002, 2003, 2002]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cfg = PoolConfig {
            process_retry_interval: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_quota_sentinel() {
        let mut cfg = PoolConfig::default();
        cfg.max_tasks_per_process = 0;
        assert_eq!(cfg.task_quota(), None);
        cfg.max_tasks_per_process = 5;
        assert_eq!(cfg.task_quota(), Some(5));
    }

    #[test]
    fn test_process_config_slices_url() {
        let cfg = PoolConfig::with_ports(&[2002, 2003]);
        let per_worker = cfg.process_config(cfg.connect_urls[1].clone());
        assert_eq!(per_worker.url, ConnectUrl::socket(2003));
        assert_eq!(per_worker.process_timeout, cfg.process_timeout);
    }
}
