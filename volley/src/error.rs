use serde::{Deserialize, Serialize};

/// Error type returned by reporters and other pluggable sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced to callers of the control surface and the registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before any run started: bad target or malformed unit params.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a single unit of work did not produce a clean answer.
///
/// These never abort a session. They are recorded as failures and kept apart
/// from plain `Failure` outcomes only so that logs can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("call timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unit panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The session was garbage collected while a caller was about to start it.
    #[error("session `{0}` was retired by the registry")]
    Retired(String),
}
