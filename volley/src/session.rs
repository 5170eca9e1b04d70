//! Session: one campaign of bursts toward a target, keyed by an opaque identity
//!
//! # Lifecycle
//! ```text
//! Idle --start--> Running --stop / target reached--> Stopping --loop drained--> Stopped
//!                    ^                                                            |
//!                    +-------------------------- start ---------------------------+
//! ```
//!
//! `start` on a session that is already running first stops the old run and
//! waits for its loop to exit before resetting the stats, so a key never has
//! two loops at once. The state lives in an atomic and every transition out of
//! `Running` is a compare-and-swap, which lets a caller's `stop` and the loop's
//! own auto-stop race without either one being lost or counted twice.
//!
//! # Batch loop
//! Each iteration asks the [`BatchController`] for a decision, spawns that
//! many units, waits for the whole burst, records every outcome and then
//! sleeps for the decided delay. Peak in-flight work is therefore bounded by
//! the burst size. Cancellation is checked before every burst and by every
//! unit before it calls out, and it cuts the inter-burst sleep short.
use std::{
    marker::PhantomData,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use typed_builder::TypedBuilder;

use crate::{
    Reporter,
    controller::{BatchController, ControllerConfig, Decision},
    error::{Error, ExecutionError, RegistryError},
    executor::{Call, RunContext, UnitExecutor},
    outcome::{Outcome, UnitParams},
    stats::{StatAggregator, StatsSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            3 => SessionState::Stopped,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct SessionConfig {
    #[builder(default)]
    pub controller: ControllerConfig,
    /// How often the throughput rate is resampled while a run is active.
    #[builder(default = Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_interval.is_zero() {
            return Err(Error::Config("sample_interval must be non-zero".into()));
        }
        self.controller.validate()
    }
}

/// Everything `status` reports about a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: String,
    pub state: SessionState,
    /// Success goal of the current run, 0 for unbounded.
    pub target: u64,
    pub stats: StatsSnapshot,
    /// Time since the run started, frozen once it stopped.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// The last burst decision, if any burst was dispatched.
    pub decision: Option<Decision>,
}

impl SessionSnapshot {
    /// The all-zero snapshot of a session that never ran.
    pub fn idle(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct RunInfo {
    target: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    decision: Option<Decision>,
}

/// State shared between a session handle and its running batch loop.
#[derive(Debug)]
struct Shared {
    key: String,
    state: AtomicU8,
    stats: StatAggregator,
    info: StdMutex<RunInfo>,
    last_activity: StdMutex<Instant>,
}

impl Shared {
    fn new(key: String) -> Self {
        Self {
            key,
            state: AtomicU8::new(SessionState::Idle as u8),
            stats: StatAggregator::new(),
            info: StdMutex::new(RunInfo::default()),
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Compare-and-swap on the state. Returns whether this caller won.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn info(&self) -> MutexGuard<'_, RunInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        let stats = self.stats.snapshot();
        let info = self.info();
        let elapsed = match info.started_at {
            Some(started) => info
                .finished_at
                .unwrap_or_else(Instant::now)
                .duration_since(started),
            None => Duration::ZERO,
        };
        SessionSnapshot {
            key: self.key.clone(),
            state,
            target: info.target,
            stats,
            elapsed,
            decision: info.decision,
        }
    }
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Signal the loop and wait until it has drained its in-flight burst.
    async fn halt(self, key: &str) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(key, "Batch loop task failed: {e}");
        }
    }
}

pub struct Session<P, C> {
    shared: Arc<Shared>,
    executor: Arc<UnitExecutor<C>>,
    config: SessionConfig,
    reporter: Option<Arc<dyn Reporter>>,
    /// Serializes start/stop on this session and owns the current run.
    run: Mutex<Option<RunHandle>>,
    retired: AtomicBool,
    _params: PhantomData<fn() -> P>,
}

impl<P, C> Session<P, C>
where
    P: UnitParams,
    C: Call<P>,
{
    /// Sessions are created by the [`SessionRegistry`](crate::SessionRegistry),
    /// which validates `config` first.
    pub(crate) fn new(
        key: impl Into<String>,
        executor: Arc<UnitExecutor<C>>,
        config: SessionConfig,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(key.into())),
            executor,
            config,
            reporter,
            run: Mutex::new(None),
            retired: AtomicBool::new(false),
            _params: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn last_activity(&self) -> Instant {
        self.shared.last_activity()
    }

    /// Whether the registry has dropped this session. A retired session can
    /// no longer be started.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Begin a new run, replacing any previous one.
    ///
    /// A previous run is stopped and its loop awaited before the stats are
    /// reset, so no outcome from the old run can leak into the new one.
    pub async fn start(&self, target: u64, params: P) -> Result<(), RegistryError> {
        let mut run = self.run.lock().await;
        if self.is_retired() {
            return Err(RegistryError::Retired(self.key().to_owned()));
        }

        if let Some(previous) = run.take() {
            if self.shared.transition(SessionState::Running, SessionState::Stopping) {
                tracing::info!(key = self.key(), "Replacing running session");
            }
            previous.halt(self.key()).await;
        }

        self.shared.stats.reset();
        *self.shared.info() = RunInfo {
            target,
            started_at: Some(Instant::now()),
            finished_at: None,
            decision: None,
        };
        self.shared.set_state(SessionState::Running);
        self.shared.touch();

        let (ctx, shutdown) = RunContext::new();
        let task = tokio::spawn(batch_loop(
            self.shared.clone(),
            self.executor.clone(),
            Arc::new(params),
            self.config.clone(),
            self.reporter.clone(),
            ctx,
        ));
        *run = Some(RunHandle { shutdown, task });

        tracing::info!(key = self.key(), target, "Session started");
        Ok(())
    }

    /// Ask the current run to stop. Idempotent, and a no-op when idle.
    ///
    /// Returns without waiting for the loop: the session passes through
    /// `Stopping` and reaches `Stopped` once the in-flight burst drains.
    pub async fn stop(&self) {
        let run = self.run.lock().await;
        if self.shared.transition(SessionState::Running, SessionState::Stopping) {
            tracing::info!(key = self.key(), "Stopping session");
        }
        if let Some(handle) = run.as_ref() {
            let _ = handle.shutdown.send(true);
        }
        self.shared.touch();
    }

    pub fn status(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Mark the session retired if it has been inactive for `retention`.
    ///
    /// Refuses while a start/stop holds the run lock or a run is in progress.
    pub(crate) fn try_retire(&self, retention: Duration, now: Instant) -> bool {
        let Ok(_run) = self.run.try_lock() else {
            return false;
        };
        if matches!(
            self.state(),
            SessionState::Running | SessionState::Stopping
        ) {
            return false;
        }
        if now.duration_since(self.last_activity()) < retention {
            return false;
        }
        self.retired.store(true, Ordering::SeqCst);
        true
    }
}

impl<P, C> Drop for Session<P, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut() {
            let _ = handle.shutdown.send(true);
        }
    }
}

fn target_reached(target: u64, stats: &StatsSnapshot) -> bool {
    target > 0 && stats.succeeded >= target
}

async fn batch_loop<P, C>(
    shared: Arc<Shared>,
    executor: Arc<UnitExecutor<C>>,
    params: Arc<P>,
    config: SessionConfig,
    reporter: Option<Arc<dyn Reporter>>,
    mut ctx: RunContext,
) where
    P: UnitParams,
    C: Call<P>,
{
    let key = shared.key.clone();
    let target = shared.info().target;
    let mut controller = BatchController::new(config.controller);
    let sampler = tokio::spawn(sample_task(shared.clone(), config.sample_interval));
    let publish = reporter.map(|reporter| {
        let (tx, rx) = watch::channel(shared.snapshot());
        tokio::spawn(write_behind(reporter, rx));
        tx
    });

    loop {
        if ctx.is_cancelled() {
            tracing::debug!(key = %key, "Batch loop observed cancellation");
            break;
        }
        let snapshot = shared.stats.snapshot();
        if target_reached(target, &snapshot) {
            if shared.transition(SessionState::Running, SessionState::Stopping) {
                tracing::info!(key = %key, target, "Target reached, stopping");
            }
            break;
        }

        let decision = controller.next(&snapshot);
        shared.info().decision = Some(decision);
        tracing::debug!(
            key = %key,
            batch_size = decision.batch_size,
            delay = ?decision.delay,
            streak = controller.streak(),
            "Dispatching burst"
        );

        let outcomes = dispatch(&executor, &params, decision.batch_size, &ctx).await;
        for outcome in outcomes.iter().flatten() {
            shared.stats.record(outcome);
        }
        shared.touch();
        if let Some(tx) = &publish {
            tx.send_replace(shared.snapshot());
        }

        if target_reached(target, &shared.stats.snapshot()) {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(decision.delay) => {}
            _ = ctx.cancelled() => {}
        }
    }

    sampler.abort();
    shared.stats.clear_rate();
    shared.info().finished_at = Some(Instant::now());
    shared.set_state(SessionState::Stopped);
    shared.touch();

    let last = shared.snapshot();
    tracing::info!(
        key = %key,
        succeeded = last.stats.succeeded,
        failed = last.stats.failed,
        elapsed = ?last.elapsed,
        average_per_minute = average_per_minute(last.stats.succeeded, last.elapsed),
        "Session stopped"
    );
    // Dropping the sender after this lets the writer flush and exit.
    if let Some(tx) = publish {
        tx.send_replace(last);
    }
}

/// Successes per minute over a whole run.
fn average_per_minute(succeeded: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        succeeded as f64 / secs * 60.0
    } else {
        0.0
    }
}

/// Fan out one burst and wait for every unit.
///
/// A unit that panics is caught here and counted as an error instead of
/// taking the loop down with it.
async fn dispatch<P, C>(
    executor: &Arc<UnitExecutor<C>>,
    params: &Arc<P>,
    batch_size: usize,
    ctx: &RunContext,
) -> Vec<Option<Outcome>>
where
    P: UnitParams,
    C: Call<P>,
{
    let handles: Vec<JoinHandle<Option<Outcome>>> = (0..batch_size)
        .map(|_| {
            let executor = executor.clone();
            let params = params.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { executor.execute(params.as_ref(), &ctx).await })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|res| match res {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Unit task failed: {e}");
                Some(ExecutionError::Panicked(e.to_string()).into())
            }
        })
        .collect()
}

async fn sample_task(shared: Arc<Shared>, every: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        shared.stats.sample();
    }
}

async fn write_behind(reporter: Arc<dyn Reporter>, mut rx: watch::Receiver<SessionSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Err(e) = reporter.report(&snapshot).await {
            tracing::warn!(key = %snapshot.key, "Failed to persist session snapshot: {e}");
        }
    }
}
