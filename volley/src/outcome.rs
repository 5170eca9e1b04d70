use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ExecutionError;

/// The payload handed to every unit of work in a session.
///
/// Params are opaque to the engine: it never looks inside them, it only
/// clones the `Arc` that holds them into each unit. They are fixed for the
/// lifetime of a run.
///
/// ## Example
/// ```rust
/// use volley::UnitParams;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct Ping {
///     path: String,
/// }
/// impl UnitParams for Ping {}
/// ```
///
/// With the `macros` feature the derives and the impl collapse into
/// `#[volley::macros::unit_params]`.
pub trait UnitParams
where
    Self: Serialize + DeserializeOwned + Send + Sync + Debug + Clone + 'static,
{
}

impl UnitParams for serde_json::Value {}

/// The result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The collaborator answered, but the answer does not count as a success.
    Failure,
    /// The call itself broke down (timeout, transport, panic).
    Error(ExecutionError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<ExecutionError> for Outcome {
    fn from(err: ExecutionError) -> Self {
        Outcome::Error(err)
    }
}
