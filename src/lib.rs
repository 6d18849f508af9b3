//! # officevisor
//!
//! **Officevisor** is a process-pool supervisor for office worker processes.
//!
//! It manages a fixed pool of headless office workers (LibreOffice-style
//! binaries accepting bridge connections), keeps each one healthy across
//! crashes, hangs, and task quotas, and hands tasks to the first worker that
//! becomes available. The crate is designed as the supervision layer under a
//! document-conversion service.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                          execute(task)
//!                               │
//! ┌─────────────────────────────▼─────────────────────────────────────┐
//! │  OfficePool                                                       │
//! │  - availability queue (mpsc, one slot per worker, no duplicates)  │
//! │  - lifecycle state: Stopped → Started → Shutdown (terminal)       │
//! └──────┬───────────────────────┬───────────────────────┬────────────┘
//!        ▼                       ▼                       ▼
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │  PoolEntry   │        │  PoolEntry   │        │  PoolEntry   │
//! │ (one worker: │        │              │        │              │
//! │  task quota, │        │              │        │              │
//! │  exec timer, │        │              │        │              │
//! │  gated exec  │        │              │        │              │
//! │  loop)       │        │              │        │              │
//! └──────┬───────┘        └──────┬───────┘        └──────┬───────┘
//!        ▼                       ▼                       ▼
//! ┌──────────────┐        ┌──────────────┐        ┌──────────────┐
//! │ ProcessSuper-│        │ ProcessSuper-│        │ ProcessSuper-│
//! │ visor (actor:│        │ visor        │        │ visor        │
//! │ start, stop, │        │              │        │              │
//! │ restart)     │        │              │        │              │
//! └──────┬───────┘        └──────┬───────┘        └──────┬───────┘
//!        │                       │                       │
//!        │ OfficeConnection      │                       │
//!        │ (connected /          │                       │
//!        │  disconnected events) │                       │
//!        ▼                       ▼                       ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Transports: ProcessTransport (spawn / find / kill)               │
//! │              BridgeTransport  (open sessions, disposal watch)     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Worker lifecycle
//! ```text
//! start ──► resolve existing process (fail / kill / connect / connect-or-kill)
//!       ──► prepare instance directory (wipe stale state, seed profile)
//!       ──► spawn worker ──► retry connect until the acceptor answers
//!       ──► connected event ──► entry joins the availability queue
//!
//! while connected {
//!   task completes        ─► count += 1; at the quota: graceful restart
//!   task overruns timeout ─► hard kill; caller gets TaskTimeout
//!   process dies          ─► disconnected event ─► automatic respawn
//! }
//!
//! stop ──► terminate over the bridge ──► await exit ──► kill on overrun
//!      ──► remove the instance directory
//! ```
//!
//! ## Features
//! | Area            | Description                                              | Key types / traits                          |
//! |-----------------|----------------------------------------------------------|---------------------------------------------|
//! | **Pool**        | Bounded acquisition, task dispatch, lifecycle.           | [`OfficePool`], [`PoolState`]               |
//! | **Supervision** | Per-worker start/stop/restart over a command actor.      | [`ProcessSupervisor`], [`RestartMode`]      |
//! | **Connection**  | Bridge session state plus connect/disconnect events.     | [`OfficeConnection`], [`ConnectionEventListener`] |
//! | **Tasks**       | Define work as trait impls or plain closures.            | [`OfficeTask`], [`OfficeTaskFn`], [`TaskRef`] |
//! | **Errors**      | Typed errors for pool operations and task execution.     | [`OfficeError`], [`TaskError`]              |
//! | **Configuration**| Central pool/worker settings, validated up front.       | [`PoolConfig`]                              |
//! | **Transports**  | OS and wire seams, swappable for tests.                  | [`ProcessTransport`], [`BridgeTransport`], [`MockOffice`] |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use officevisor::{
//!     MockOffice, OfficePool, OfficeTaskFn, PoolConfig, TaskContext, TaskRef,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), officevisor::OfficeError> {
//!     // MockOffice stands in for a real installation; production code uses
//!     // OfficePool::new(cfg) with the built-in transports.
//!     let office = MockOffice::new();
//!     let cfg = PoolConfig::with_ports(&[2002, 2003]);
//!     let pool = OfficePool::with_transports(
//!         cfg,
//!         Arc::new(office.clone()),
//!         Arc::new(office),
//!     )?;
//!     pool.start().await?;
//!
//!     let hello: TaskRef = OfficeTaskFn::arc("hello", |ctx: TaskContext| async move {
//!         println!("running against {}", ctx.url());
//!         Ok(())
//!     });
//!     pool.execute(hello).await?;
//!
//!     pool.stop().await?;
//!     Ok(())
//! }
//! ```
mod config;
mod connection;
mod error;
mod events;
mod office;
mod registry;
mod retry;
mod task;
mod transport;

// ---- Public re-exports ----

pub use config::{ExistingProcessAction, PoolConfig, ProcessConfig};
pub use connection::OfficeConnection;
pub use error::{OfficeError, TaskError};
pub use events::{ConnectionEvent, ConnectionEventListener, ConnectionState};
pub use office::{OfficePool, PoolState, ProcessSupervisor, RestartMode};
pub use registry::PoolRegistry;
pub use task::{OfficeTask, OfficeTaskFn, TaskContext, TaskRef};
pub use transport::{
    BridgeError, BridgeSession, BridgeTransport, ConnectUrl, LocalProcessTransport, MockOffice,
    PidStatus, ProcessQuery, ProcessTransport, TcpBridge, WorkerCommand, WorkerProcess,
};
