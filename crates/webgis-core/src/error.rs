//! Error taxonomy shared by the tree, the tracker, the scheduler and remote clients

use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Error {
    /// Resource is busy with another operation, or already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    #[error("cannot move resource {id} under its own descendant {new_parent}")]
    Cycle {
        id: ResourceId,
        new_parent: ResourceId,
    },

    #[error("resource group {0} is not empty")]
    NonEmptyGroup(ResourceId),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Timeouts and 5xx-equivalents. The only retryable class.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("scheduler stopped before the batch resolved")]
    Shutdown,

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn invalid_intent(message: impl Into<String>) -> Self {
        Self::InvalidIntent(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// Whether retrying the same remote call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Access errors ask the user to log in again instead of being retried.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    /// Stable machine-readable code, used in reports and by the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Cycle { .. } => "CYCLE",
            Self::NonEmptyGroup(_) => "NON_EMPTY_GROUP",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Transient(_) => "TRANSIENT",
            Self::InvalidIntent(_) => "INVALID_INTENT",
            Self::Config(_) => "CONFIG",
            Self::Shutdown => "SHUTDOWN",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Parse a code back into a representative error. Used to script failures.
    pub fn from_code(code: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        let err = match code.to_ascii_uppercase().as_str() {
            "CONFLICT" => Self::Conflict(message),
            "ACCESS_DENIED" => Self::AccessDenied(message),
            "TRANSIENT" => Self::Transient(message),
            "UNKNOWN" => Self::Unknown(message),
            _ => return None,
        };
        Some(err)
    }
}
