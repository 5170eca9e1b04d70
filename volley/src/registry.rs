//! Session registry: the one structure every caller mutates concurrently.
//!
//! All map operations happen under a single lock, so lookups, creations and
//! removals for a key are linearizable. Sessions for distinct keys share
//! nothing but the [`UnitExecutor`].
//!
//! Garbage collection removes sessions that are not running and have been
//! inactive for longer than the retention window. A collected session is
//! marked retired while its run lock is held, so a `start` racing the
//! collector either wins the lock first (and the collector backs off) or sees
//! the retirement and starts over on a freshly created entry.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    Reporter,
    error::{Error, RegistryError},
    executor::{Call, UnitExecutor},
    outcome::UnitParams,
    session::{Session, SessionConfig, SessionSnapshot},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RegistryConfig {
    #[builder(default)]
    pub session: SessionConfig,
    /// Upper bound on a single unit's external call.
    #[builder(default = Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub unit_timeout: Duration,
    /// How long a stopped session is kept around after its last activity.
    #[builder(default = Duration::from_secs(6 * 60 * 60))]
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[builder(default = Duration::from_secs(5 * 60))]
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.unit_timeout.is_zero() {
            return Err(Error::Config("unit_timeout must be non-zero".into()));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::Config("gc_interval must be non-zero".into()));
        }
        self.session.validate()
    }
}

pub struct SessionRegistry<P, C> {
    sessions: Mutex<HashMap<String, Arc<Session<P, C>>>>,
    executor: Arc<UnitExecutor<C>>,
    config: RegistryConfig,
    reporter: Option<Arc<dyn Reporter>>,
}

impl<P, C> SessionRegistry<P, C>
where
    P: UnitParams,
    C: Call<P>,
{
    pub fn new(call: C, config: RegistryConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            executor: Arc::new(UnitExecutor::new(call, config.unit_timeout)),
            config,
            reporter: None,
        })
    }

    /// Persist snapshots of every session through `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session<P, C>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session<P, C>>> {
        self.sessions().get(key).cloned()
    }

    /// The session for `key`, created idle if it does not exist yet.
    pub fn get_or_create(&self, key: &str) -> Arc<Session<P, C>> {
        self.sessions()
            .entry(key.to_owned())
            .or_insert_with(|| {
                tracing::debug!(key, "Creating session");
                Arc::new(Session::new(
                    key,
                    self.executor.clone(),
                    self.config.session.clone(),
                    self.reporter.clone(),
                ))
            })
            .clone()
    }

    /// Start (or restart) the session for `key`, creating it on demand.
    ///
    /// If the collector retires the session between lookup and start, the
    /// entry is recreated and the start retried once.
    pub async fn start_for(
        &self,
        key: &str,
        target: u64,
        params: P,
    ) -> Result<Arc<Session<P, C>>, RegistryError> {
        let session = self.get_or_create(key);
        match session.start(target, params.clone()).await {
            Ok(()) => Ok(session),
            Err(RegistryError::Retired(_)) => {
                tracing::debug!(key, "Session retired during start, retrying");
                let session = self.get_or_create(key);
                session.start(target, params).await?;
                Ok(session)
            }
        }
    }

    /// Stop the session for `key`. Unknown keys are already stopped.
    pub async fn stop_for(&self, key: &str) {
        if let Some(session) = self.get(key) {
            session.stop().await;
        }
    }

    /// Status of `key`, or the all-zero snapshot when it is unknown.
    pub fn status_for(&self, key: &str) -> SessionSnapshot {
        self.get(key)
            .map(|session| session.status())
            .unwrap_or_else(|| SessionSnapshot::idle(key))
    }

    /// Remove sessions idle past the retention window. Returns how many went.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|key, session| {
            let retired = session.try_retire(retention, now);
            if retired {
                tracing::debug!(key = %key, "Collected idle session");
            }
            !retired
        });
        before - sessions.len()
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `gc_interval`.
    ///
    /// The task only holds a weak reference and ends once the registry is
    /// dropped.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = self.config.gc_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.collect_garbage();
                if removed > 0 {
                    tracing::info!(removed, remaining = registry.len(), "Session garbage collection");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        outcome::Outcome,
        session::{
            SessionState,
            tests::{fixed_controller, wait_for},
        },
    };

    type Params = serde_json::Value;

    fn registry<C: Call<Params>>(call: C) -> SessionRegistry<Params, C> {
        let config = RegistryConfig::builder()
            .session(fixed_controller(10))
            .retention(Duration::from_secs(60))
            .gc_interval(Duration::from_secs(10))
            .build();
        SessionRegistry::new(call, config).unwrap()
    }

    fn always_ok() -> impl Fn(Params) -> std::future::Ready<Outcome> + Send + Sync + 'static {
        |_| std::future::ready(Outcome::Success)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RegistryConfig::builder()
            .unit_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            SessionRegistry::new(always_ok(), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_sized_bursts_are_rejected_before_any_session_exists() {
        let controller = crate::controller::ControllerConfig::builder()
            .batch_size(0)
            .min_batch_size(0)
            .build();
        let config = RegistryConfig::builder()
            .session(SessionConfig::builder().controller(controller).build())
            .build();

        assert!(matches!(
            SessionRegistry::new(always_ok(), config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_create_is_stable_per_key() {
        let registry = registry(always_ok());

        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        let b = registry.get_or_create("b");

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert_eq!(a.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_keys_are_harmless() {
        let registry = registry(always_ok());

        registry.stop_for("ghost").await;

        assert_eq!(registry.status_for("ghost"), SessionSnapshot::idle("ghost"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_do_not_share_counters() {
        let registry = registry(always_ok());

        let x = registry.start_for("x", 30, Params::Null).await.unwrap();
        let y = registry.start_for("y", 70, Params::Null).await.unwrap();
        wait_for(&x, SessionState::Stopped).await;
        wait_for(&y, SessionState::Stopped).await;

        assert_eq!(registry.status_for("x").stats.succeeded, 30);
        assert_eq!(registry.status_for("y").stats.succeeded, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_collected() {
        let registry = registry(always_ok());
        let old = registry.start_for("a", 10, Params::Null).await.unwrap();
        wait_for(&old, SessionState::Stopped).await;

        assert_eq!(registry.collect_garbage(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.collect_garbage(), 1);
        assert!(registry.get("a").is_none());

        let fresh = registry.get_or_create("a");
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.status(), SessionSnapshot::idle("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn running_sessions_survive_collection() {
        let registry = registry(always_ok());
        let running = registry.start_for("busy", 0, Params::Null).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.collect_garbage(), 0);
        assert_eq!(running.state(), SessionState::Running);

        registry.stop_for("busy").await;
        wait_for(&running, SessionState::Stopped).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_recreates_a_retired_entry() {
        let registry = registry(always_ok());
        let stale = registry.start_for("a", 10, Params::Null).await.unwrap();
        wait_for(&stale, SessionState::Stopped).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        // The collector marks the session retired; a caller still holding the
        // old handle must not be able to revive it.
        registry.collect_garbage();
        assert!(stale.is_retired());
        assert!(stale.start(10, Params::Null).await.is_err());

        let session = registry.start_for("a", 10, Params::Null).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &session));
        wait_for(&session, SessionState::Stopped).await;
        assert_eq!(registry.status_for("a").stats.succeeded, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_task_runs_periodically_and_ends_with_registry() {
        let registry = Arc::new(registry(always_ok()));
        registry.get_or_create("idle");
        let gc = registry.spawn_gc();

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(registry.get("idle").is_none());

        drop(registry);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(gc.is_finished());
    }
}
