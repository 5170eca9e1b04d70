//! Executor: running one unit of work against an external collaborator
//!
//! The engine never talks to the outside world directly. Everything it knows
//! about a unit of work goes through a [`Call`], the collaborator that performs
//! the actual request/response cycle and classifies the answer as an
//! [`Outcome`]. [`UnitExecutor`] wraps a `Call` with the two guarantees the
//! batch loop relies on:
//!
//! - a unit that observes cancellation before it starts returns `None` and
//!   performs no call. It is not counted anywhere.
//! - every call is bounded by a fixed timeout, so no burst can hang forever.
//!   A timeout becomes [`ExecutionError::Timeout`], which the aggregator counts
//!   exactly like a plain failure.
//!
//! The executor never records anything itself. It hands the outcome back to
//! the caller, which owns the session's aggregator.
//!
//! # Cancellation
//! Each run creates a fresh [`RunContext`] together with the `watch::Sender`
//! that stops it. Contexts are cheap to clone, every unit in a burst gets its
//! own copy.
#[cfg(feature = "builtins")]
pub mod http;
#[cfg(feature = "builtins")]
pub use http::HttpCall;

use std::{future::Future, time::Duration};

use tokio::sync::watch::{Receiver, Sender, channel};

use crate::{error::ExecutionError, outcome::Outcome, outcome::UnitParams};

/// The network call collaborator.
///
/// Implementations perform one external request for the given params and
/// decide whether it succeeded. Errors must be folded into the returned
/// `Outcome`, there is no error channel.
///
/// Closures taking the params by value implement `Call` as well, which is
/// handy for stubs:
///
/// ```rust
/// use volley::{Outcome, executor::UnitExecutor};
/// use std::time::Duration;
///
/// let executor = UnitExecutor::new(
///     |_: serde_json::Value| async { Outcome::Success },
///     Duration::from_secs(1),
/// );
/// # let _ = executor;
/// ```
pub trait Call<P: UnitParams>: Send + Sync + 'static {
    fn call(&self, params: &P) -> impl Future<Output = Outcome> + Send;
}

impl<P, F, Fut> Call<P> for F
where
    P: UnitParams,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send,
{
    fn call(&self, params: &P) -> impl Future<Output = Outcome> + Send {
        (self)(params.clone())
    }
}

/// Per-run cancellation state shared by the batch loop and all of its units.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Flips to `true` once the run has been asked to stop.
    pub shutdown: Receiver<bool>,
}

impl RunContext {
    pub fn new() -> (Self, Sender<bool>) {
        let (tx, rx) = channel(false);
        (Self { shutdown: rx }, tx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the run is cancelled, or once the sender is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.shutdown.wait_for(|b| *b).await;
    }
}

/// Wraps a [`Call`] with cancellation and timeout handling.
#[derive(Debug)]
pub struct UnitExecutor<C> {
    call: C,
    timeout: Duration,
}

impl<C> UnitExecutor<C> {
    pub fn new(call: C, timeout: Duration) -> Self {
        Self { call, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a single unit of work.
    ///
    /// Returns `None` when the run was cancelled before the unit started.
    /// Such a unit never reached the collaborator and must not be counted.
    pub async fn execute<P>(&self, params: &P, ctx: &RunContext) -> Option<Outcome>
    where
        P: UnitParams,
        C: Call<P>,
    {
        if ctx.is_cancelled() {
            return None;
        }

        let outcome = match tokio::time::timeout(self.timeout, self.call.call(params)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionError::Timeout(self.timeout.as_millis() as u64).into(),
        };

        if let Outcome::Error(err) = &outcome {
            tracing::debug!("Unit ended with an error: {err}");
        }
        Some(outcome)
    }
}
