use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::record::{EntityType, OperationKind};

/// Whether a failed attempt may be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Failure reported by a reconciler (or produced by the router on its
/// behalf). Every variant carries a fixed classification; see [`class`].
///
/// [`class`]: ReconcileError::class
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("External service returned HTTP {status}: {message}")]
    External { status: u16, message: String },

    #[error("Rate limited by external service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Entity not found: {0}")]
    EntityMissing(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("{operation} is not implemented for {entity_type}")]
    NotImplemented {
        operation: OperationKind,
        entity_type: EntityType,
    },

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Classify an HTTP response from the external system: 429 and 5xx are
    /// transient, every other 4xx is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 429 {
            return ReconcileError::RateLimited { retry_after: None };
        }
        ReconcileError::External {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Network(_)
            | ReconcileError::RateLimited { .. }
            | ReconcileError::Timeout(_)
            | ReconcileError::Other(_)
            | ReconcileError::Internal(_) => ErrorClass::Retryable,
            ReconcileError::External { status, .. } => {
                if *status == 429 || *status >= 500 || *status < 400 {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Terminal
                }
            }
            ReconcileError::EntityMissing(_)
            | ReconcileError::Configuration(_)
            | ReconcileError::NotImplemented { .. }
            | ReconcileError::Rejected(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Minimum wait requested by the external system, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(ReconcileError::from_status(503, "unavailable").is_retryable());
        assert!(ReconcileError::from_status(500, "boom").is_retryable());
        assert!(ReconcileError::from_status(429, "slow down").is_retryable());
        assert!(!ReconcileError::from_status(404, "gone").is_retryable());
        assert!(!ReconcileError::from_status(400, "bad body").is_retryable());
        assert!(matches!(
            ReconcileError::from_status(429, ""),
            ReconcileError::RateLimited { retry_after: None }
        ));
    }

    #[test]
    fn unclassified_errors_default_to_retryable() {
        assert_eq!(ReconcileError::Other("???".into()).class(), ErrorClass::Retryable);
        assert_eq!(ReconcileError::Timeout(Duration::from_secs(1)).class(), ErrorClass::Retryable);
    }

    #[test]
    fn structural_errors_are_terminal() {
        let not_impl = ReconcileError::NotImplemented {
            operation: OperationKind::Delete,
            entity_type: EntityType::Employee,
        };
        assert_eq!(not_impl.class(), ErrorClass::Terminal);
        assert_eq!(not_impl.to_string(), "delete is not implemented for employee");
        assert_eq!(ReconcileError::EntityMissing("dish-1".into()).class(), ErrorClass::Terminal);
        assert_eq!(ReconcileError::Configuration("no token".into()).class(), ErrorClass::Terminal);
    }

    #[test]
    fn retry_after_is_only_reported_for_rate_limits() {
        let limited = ReconcileError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(ReconcileError::Network("reset".into()).retry_after(), None);
    }
}
