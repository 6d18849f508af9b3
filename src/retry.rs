//! # Retry: run an operation until success or timeout.
//!
//! [`Retry`] is the primitive under every "wait for a process or connection to
//! reach a state" operation in the supervisor: poll an exit code, wait for a
//! PID to appear, retry a bridge handshake against a worker that is still
//! starting up.
//!
//! The attempted operation reports through [`Attempt`] instead of signalling
//! "try again" with a dedicated error type:
//! - `Ok(Attempt::Done(v))` — finished, the loop returns `v`.
//! - `Ok(Attempt::Retry(cause))` — temporary failure; sleep and try again
//!   while the elapsed time since the first attempt stays below the budget.
//! - `Err(e)` — fatal failure; propagates immediately, uncaught.
//!
//! ## Rules
//! - The timeout bounds *elapsed time since the first attempt*, so at least
//!   one attempt always runs, even with a zero budget.
//! - Exhaustion returns [`OfficeError::RetryTimeout`] wrapping the **last**
//!   temporary cause.
//! - Cancellation during the initial delay or an interval sleep aborts the
//!   loop with [`OfficeError::Cancelled`]; it is never swallowed.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::OfficeError;

/// Outcome of one attempt inside a [`Retry`] loop.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation finished; stop retrying.
    Done(T),
    /// Temporary failure; retry while the budget lasts.
    Retry(OfficeError),
}

/// Retry loop parameters: initial delay, pause between attempts, total budget.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    /// Pause before the first attempt (`ZERO` = attempt immediately).
    pub delay: Duration,
    /// Pause between attempts.
    pub interval: Duration,
    /// Elapsed-time budget, measured from the first attempt.
    pub timeout: Duration,
}

impl Retry {
    /// Creates a loop with no initial delay.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            interval,
            timeout,
        }
    }

    /// Creates a loop with an initial delay before the first attempt.
    pub fn with_delay(delay: Duration, interval: Duration, timeout: Duration) -> Self {
        Self {
            delay,
            interval,
            timeout,
        }
    }

    /// Runs `op` until it reports [`Attempt::Done`], fails fatally, exhausts
    /// the budget, or `token` is cancelled during a sleep.
    pub async fn run<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T, OfficeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>, OfficeError>>,
    {
        if !self.delay.is_zero() {
            self.pause(token, self.delay).await?;
        }

        let first_attempt = Instant::now();
        loop {
            match op().await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(cause) => {
                    let elapsed = first_attempt.elapsed();
                    if elapsed >= self.timeout {
                        return Err(OfficeError::RetryTimeout {
                            elapsed,
                            source: Box::new(cause),
                        });
                    }
                    self.pause(token, self.interval).await?;
                }
            }
        }
    }

    /// Cancellable sleep; cancellation aborts the whole loop.
    async fn pause(&self, token: &CancellationToken, duration: Duration) -> Result<(), OfficeError> {
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            _ = token.cancelled() => Err(OfficeError::Cancelled),
        }
    }
}
