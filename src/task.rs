//! # Task abstraction and function-backed task implementation.
//!
//! This module defines the [`OfficeTask`] trait (async, cancelable) and a
//! convenient function-backed implementation [`OfficeTaskFn`]. The common
//! handle type is [`TaskRef`], an `Arc<dyn OfficeTask>` suitable for sharing
//! across the pool.
//!
//! The pool treats tasks as opaque: it only observes success, failure, or
//! timeout. A task receives a [`TaskContext`] exposing the live connection
//! and a [`CancellationToken`]; it should check the token at safe points so
//! a timed-out or crashed execution can be abandoned promptly.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::connection::OfficeConnection;
use crate::error::TaskError;
use crate::transport::{BridgeSession, ConnectUrl};

/// Shared handle to a task, as accepted by
/// [`OfficePool::execute`](crate::OfficePool::execute).
pub type TaskRef = Arc<dyn OfficeTask>;

/// What a task sees of the worker it runs against.
#[derive(Clone)]
pub struct TaskContext {
    url: ConnectUrl,
    connection: Arc<OfficeConnection>,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        url: ConnectUrl,
        connection: Arc<OfficeConnection>,
        token: CancellationToken,
    ) -> Self {
        Self {
            url,
            connection,
            token,
        }
    }

    /// Address of the worker this execution is bound to.
    pub fn url(&self) -> &ConnectUrl {
        &self.url
    }

    /// The connection to the worker.
    pub fn connection(&self) -> &Arc<OfficeConnection> {
        &self.connection
    }

    /// The live bridge session, if the worker is still connected.
    pub fn session(&self) -> Option<Arc<dyn BridgeSession>> {
        self.connection.session()
    }

    /// Token cancelled on task timeout, worker loss, and pool shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// True once this execution should be abandoned.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// # Asynchronous, cancelable unit of work against one worker.
///
/// An `OfficeTask` has a stable [`name`](OfficeTask::name) and an async
/// [`execute`](OfficeTask::execute) method. Implementations should check
/// `ctx.is_cancelled()` at safe points and exit quickly when set.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use officevisor::{OfficeTask, TaskContext, TaskError};
///
/// struct Probe;
///
/// #[async_trait]
/// impl OfficeTask for Probe {
///     fn name(&self) -> &str { "probe" }
///
///     async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
///         if ctx.is_cancelled() {
///             return Err(TaskError::Cancelled);
///         }
///         // talk to the worker through ctx.session()...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait OfficeTask: Send + Sync + 'static {
    /// Returns a stable, human-readable task name.
    fn name(&self) -> &str;

    /// Executes the task against the worker behind `ctx`.
    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError>;
}

/// Function-backed task implementation.
///
/// Wraps a closure that *creates* a new future per execution, so there is no
/// shared mutable state between runs; share state explicitly with `Arc` when
/// needed.
///
/// ## Example
/// ```
/// use officevisor::{OfficeTaskFn, TaskContext, TaskError, TaskRef};
///
/// let task: TaskRef = OfficeTaskFn::arc("convert", |ctx: TaskContext| async move {
///     if ctx.is_cancelled() {
///         return Err(TaskError::Cancelled);
///     }
///     Ok(())
/// });
/// assert_eq!(task.name(), "convert");
/// ```
pub struct OfficeTaskFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> OfficeTaskFn<F> {
    /// Creates a new function-backed task.
    ///
    /// Prefer [`OfficeTaskFn::arc`] when you immediately need a [`TaskRef`].
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the task and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> OfficeTask for OfficeTaskFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: TaskContext) -> Result<(), TaskError> {
        (self.f)(ctx).await
    }
}
