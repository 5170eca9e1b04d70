//! Volley: bounded-concurrency request fan-out with adaptive pacing.
//!
//! Volley drives campaigns of outbound calls against an external collaborator.
//! A campaign ([`Session`]) fires bursts of concurrent units of work, waits for
//! each burst to finish, and sizes the next one from how well the previous ones
//! went. Sessions are addressed by an opaque key through an idempotent
//! start/stop/status [`ControlSurface`], and every session keeps its own
//! counters and live throughput.
//!
//! # Architecture
//!
//! The building blocks, leaves first:
//!
//! - [`Call`]: the collaborator that performs one external request and
//!   classifies the answer as an [`Outcome`]. Volley knows nothing about the
//!   request itself. A closure is enough for tests, [`executor::HttpCall`] covers
//!   the common JSON-over-HTTP case.
//! - [`UnitExecutor`]: wraps a `Call` with cancellation and a fixed timeout.
//! - [`StatAggregator`]: thread-safe issued/succeeded/failed counters plus a
//!   sampled throughput rate.
//! - [`BatchController`]: a pure decision function from the success ratio (and
//!   a streak of high-success bursts) to the next burst size and delay.
//! - [`Session`]: the state machine and batch loop of one campaign.
//! - [`SessionRegistry`]: key → session map with garbage collection.
//! - [`ControlSurface`]: the contract a transport exposes to callers.
//! - [`Reporter`]: optional write-behind sink for session snapshots.
//!
//! # Data flow
//!
//! ```text
//! ControlSurface -> SessionRegistry -> Session::start -> batch loop
//!     batch loop -> BatchController (size, delay)
//!                -> UnitExecutor x batch_size (concurrently)
//!                -> StatAggregator (one combined update per outcome)
//!                -> Reporter (write-behind)
//! ControlSurface::status <- StatAggregator snapshot
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use volley::{
//!     ControlSurface, SessionRegistry,
//!     control::JsonValidator,
//!     executor::HttpCall,
//!     registry::RegistryConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     // Build the HTTP client once, every unit of every session shares it.
//!     let call = HttpCall::builder().url("http://localhost:3000/ingest").build();
//!     let registry = Arc::new(
//!         SessionRegistry::<serde_json::Value, _>::new(call, RegistryConfig::default()).unwrap(),
//!     );
//!     let _gc = registry.spawn_gc();
//!     let control = ControlSurface::new(registry, JsonValidator);
//!
//!     let started = control.start("tenant-a", 500, &serde_json::json!({"n": 1})).await;
//!     assert!(started.accepted);
//!     println!("{:#?}", control.status("tenant-a"));
//!     control.stop("tenant-a").await;
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: the `#[unit_params]` attribute that derives what [`UnitParams`]
//!   needs. (Enabled by default)
//! - `builtins`: [`executor::HttpCall`] plus the in-memory and tracing
//!   reporters. (Enabled by default)

/// Start/stop/status contract for transports
pub mod control;
/// Adaptive burst sizing
pub mod controller;
pub mod error;
/// Running single units of work
pub mod executor;
/// Unit results and payloads
pub mod outcome;
/// Key to session mapping and garbage collection
pub mod registry;
/// Snapshot persistence
pub mod report;
/// Session state machine and batch loop
pub mod session;
/// Counters and throughput
pub mod stats;

pub use control::ControlSurface;
pub use controller::BatchController;
pub use error::Error;
pub use executor::{Call, UnitExecutor};
pub use outcome::{Outcome, UnitParams};
pub use registry::SessionRegistry;
pub use report::Reporter;
pub use session::Session;
pub use stats::StatAggregator;

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use volley_macros::*;
}
