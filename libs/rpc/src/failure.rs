use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification carried by a [`Failure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The function ran and reported an error
    Execution,
    /// The function rejected its arguments
    InvalidArguments,
    /// The result could not be encoded for the wire
    Serialization,
    /// Liveness ping: the peer has no record of the call
    NoSuchCall,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Execution => "execution error",
            FailureKind::InvalidArguments => "invalid arguments",
            FailureKind::Serialization => "serialization error",
            FailureKind::NoSuchCall => "no such call",
        };
        f.write_str(name)
    }
}

/// Serializable description of a failed call
///
/// This is what travels in a `CallFail` message: a classification and a
/// human-readable message, never a live error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Serialization, message)
    }

    pub fn no_such_call(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NoSuchCall, message)
    }

    /// Capture any error as an execution failure
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::execution(error.to_string())
    }
}
