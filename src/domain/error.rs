use serde::Serialize;
use thiserror::Error;

use crate::cache::BuildError;

/// Status attached to a rejected mutation whose criteria address nothing.
pub const INVALID_CRITERIA_STATUS: u16 = 400;
const INVALID_CRITERIA_REASON: &str = "Invalid criteria";

/// Broad classification of [`SubsocketError`], for callers that only need to
/// decide between "fix your setup" and "this request failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    DuplicateRegistration,
    NotFound,
    Build,
    Apply,
}

#[derive(Debug, Error)]
pub enum SubsocketError {
    #[error("invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        argument: &'static str,
        reason: String,
    },
    #[error("namespace `{name}` is already registered")]
    DuplicateNamespace { name: String },
    #[error("event `{event}` is already bound")]
    DuplicateEvent { event: String },
    #[error("namespace `{name}` is not registered")]
    UnknownNamespace { name: String },
    #[error("no dispatcher is bound to `{event}`")]
    UnknownEvent { event: String },
    #[error("value source failed: {0}")]
    Build(#[from] BuildError),
    #[error("apply callback failed: {0}")]
    Apply(#[from] ApplyError),
}

impl SubsocketError {
    pub fn invalid_argument(argument: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SubsocketError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            SubsocketError::DuplicateNamespace { .. } | SubsocketError::DuplicateEvent { .. } => {
                ErrorKind::DuplicateRegistration
            }
            SubsocketError::UnknownNamespace { .. } | SubsocketError::UnknownEvent { .. } => {
                ErrorKind::NotFound
            }
            SubsocketError::Build(_) => ErrorKind::Build,
            SubsocketError::Apply(_) => ErrorKind::Apply,
        }
    }
}

/// Failure raised by caller-supplied mutation logic.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ApplyError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Structured reason a mutation was refused. Returned as a value so transport
/// adapters can map it onto their own failure responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReason {
    pub event: String,
    pub reason: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl ErrorReason {
    pub fn new(event: impl Into<String>, reason: impl Into<String>, status_code: u16) -> Self {
        Self {
            event: event.into(),
            reason: reason.into(),
            status_code,
        }
    }

    pub fn invalid_criteria(event: impl Into<String>) -> Self {
        Self::new(event, INVALID_CRITERIA_REASON, INVALID_CRITERIA_STATUS)
    }
}
