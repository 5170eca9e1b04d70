use async_trait::async_trait;

use crate::{error::BoxError, session::SessionSnapshot};

/// A [`Reporter`] receives session snapshots and stores them somewhere:
/// memory, a log, a database.
///
/// Reporters sit behind the batch loop as a write-behind sink. They are never
/// the system of record for a running session, a slow or failing reporter only
/// delays or loses snapshots, it never slows down or aborts the run. Snapshots
/// may be coalesced: only the latest one published before the reporter gets
/// around to it is delivered, but the final snapshot of every run always is.
///
/// # Example
/// ```rust
/// use volley::{Reporter, error::BoxError, session::SessionSnapshot};
///
/// struct Stdout;
///
/// #[async_trait::async_trait]
/// impl Reporter for Stdout {
///     async fn report(&self, snapshot: &SessionSnapshot) -> Result<(), BoxError> {
///         println!("{}", serde_json::to_string(snapshot)?);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, snapshot: &SessionSnapshot) -> Result<(), BoxError>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{
        collections::HashMap,
        sync::{Mutex, PoisonError},
    };

    use super::*;

    /// Keeps the latest snapshot of every session in memory.
    #[derive(Debug, Default)]
    pub struct MemoryReporter {
        latest: Mutex<HashMap<String, SessionSnapshot>>,
    }

    impl MemoryReporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get(&self, key: &str) -> Option<SessionSnapshot> {
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
        }
    }

    #[async_trait]
    impl Reporter for MemoryReporter {
        async fn report(&self, snapshot: &SessionSnapshot) -> Result<(), BoxError> {
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(snapshot.key.clone(), snapshot.clone());
            Ok(())
        }
    }

    /// Logs every snapshot it receives at `info` level.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TracingReporter;

    #[async_trait]
    impl Reporter for TracingReporter {
        async fn report(&self, snapshot: &SessionSnapshot) -> Result<(), BoxError> {
            let s = &snapshot.stats;
            tracing::info!(
                key = %snapshot.key,
                state = ?snapshot.state,
                "{}/{} succeeded | ratio {:.1}% | {:.1} rps | {:.1} rpm",
                s.succeeded,
                snapshot.target,
                s.success_ratio * 100.0,
                s.throughput_per_second,
                s.throughput_per_minute,
            );
            Ok(())
        }
    }
}
