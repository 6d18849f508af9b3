//! # Office supervision core: supervisor, pool entry, pool.
//!
//! The component hierarchy, leaf-first:
//!
//! - [`workdir`] — instance working directory lifecycle (create, seed from a
//!   template profile, delete, rename fallback).
//! - [`ProcessSupervisor`] — owns one worker process plus one connection;
//!   start/stop/restart funnel through a single lifecycle actor.
//! - [`PoolEntry`] — wraps one supervisor; serializes task execution through
//!   a suspendable executor, counts tasks toward the quota, and reacts to
//!   connection events.
//! - [`OfficePool`] — N entries behind a bounded availability queue with the
//!   stopped/started/shutdown lifecycle.

pub(crate) mod workdir;

mod entry;
mod pool;
mod supervisor;

pub(crate) use entry::PoolEntry;

pub use pool::{OfficePool, PoolState};
pub use supervisor::{ProcessSupervisor, RestartMode};
