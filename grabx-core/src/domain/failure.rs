//! Fetcher failure types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed grab attempt, supplied by the fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// May succeed if attempted again (timeouts, temporary unavailability)
    Transient,
    /// Will not be resolved by retrying (malformed target, unauthorized)
    Permanent,
}

/// A classified failure returned by a fetcher for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} failure: {message}")]
pub struct GrabFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl GrabFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a failure that is eligible for retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Creates a failure that ends the job immediately
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_kind() {
        assert!(GrabFailure::transient("timeout").is_transient());
        assert!(!GrabFailure::permanent("bad url").is_transient());
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let failure = GrabFailure::permanent("HTTP Error 403");
        assert_eq!(failure.to_string(), "Permanent failure: HTTP Error 403");
    }
}
