//! Control surface: the start/stop/status contract a transport exposes.
//!
//! The transport itself (HTTP, RPC, a CLI) is not part of this crate. It hands
//! raw caller input to [`ControlSurface`] and serializes what comes back. All
//! request and response types implement serde for that purpose.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Error,
    executor::Call,
    outcome::UnitParams,
    registry::SessionRegistry,
    session::SessionSnapshot,
};

/// Turns raw caller input into normalized unit params, or rejects it with a
/// human-readable reason.
pub trait Validator<P>: Send + Sync {
    fn validate(&self, raw: &Value) -> Result<P, String>;
}

impl<P, F> Validator<P> for F
where
    F: Fn(&Value) -> Result<P, String> + Send + Sync,
{
    fn validate(&self, raw: &Value) -> Result<P, String> {
        (self)(raw)
    }
}

/// Accepts anything that deserializes into `P`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValidator;

impl<P: UnitParams> Validator<P> for JsonValidator {
    fn validate(&self, raw: &Value) -> Result<P, String> {
        serde_json::from_value(raw.clone()).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub accepted: bool,
}

pub struct ControlSurface<P, C, V> {
    registry: Arc<SessionRegistry<P, C>>,
    validator: V,
}

impl<P, C, V> ControlSurface<P, C, V>
where
    P: UnitParams,
    C: Call<P>,
    V: Validator<P>,
{
    pub fn new(registry: Arc<SessionRegistry<P, C>>, validator: V) -> Self {
        Self {
            registry,
            validator,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<P, C>> {
        &self.registry
    }

    /// Validate the request and start the session for `key`.
    ///
    /// Every rejection happens before anything is touched: a bad request
    /// leaves no session behind.
    pub async fn try_start(&self, key: &str, target: i64, raw: &Value) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::InvalidParams("session key must not be empty".into()));
        }
        let target = u64::try_from(target)
            .map_err(|_| Error::InvalidParams(format!("target must be non-negative, got {target}")))?;
        let params = self.validator.validate(raw).map_err(Error::InvalidParams)?;
        self.registry.start_for(key, target, params).await?;
        Ok(())
    }

    pub async fn start(&self, key: &str, target: i64, raw: &Value) -> StartResponse {
        match self.try_start(key, target, raw).await {
            Ok(()) => StartResponse {
                accepted: true,
                reason: None,
            },
            Err(e) => {
                tracing::warn!(key, "Rejected start: {e}");
                StartResponse {
                    accepted: false,
                    reason: Some(e.to_string()),
                }
            }
        }
    }

    /// Always accepted, even for keys that never existed.
    pub async fn stop(&self, key: &str) -> StopResponse {
        self.registry.stop_for(key).await;
        StopResponse { accepted: true }
    }

    pub fn status(&self, key: &str) -> SessionSnapshot {
        self.registry.status_for(key)
    }
}
