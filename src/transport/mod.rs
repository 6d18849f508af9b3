//! # Transport seams: the OS and wire boundaries of the pool.
//!
//! The supervisor core never talks to the operating system or the worker
//! protocol directly. Everything below the pool goes through two narrow
//! traits:
//!
//! - [`ProcessTransport`] — spawn a worker, find one in the process table,
//!   deliver a hard kill. Default: [`LocalProcessTransport`].
//! - [`BridgeTransport`] — open a [`BridgeSession`] against a worker's
//!   acceptor. Default: [`TcpBridge`].
//!
//! [`MockOffice`] implements both seams over one in-memory worker table and
//! ships un-gated, so downstream crates can exercise a full pool without a
//! worker installation.

mod bridge;
mod command;
mod mock;
mod process;

pub use bridge::{BridgeError, BridgeSession, BridgeTransport, TcpBridge};
pub use command::{ConnectUrl, ProcessQuery, WorkerCommand};
pub use mock::MockOffice;
pub use process::{LocalProcessTransport, PidStatus, ProcessTransport, WorkerProcess};
