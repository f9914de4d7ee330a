//! # Error Types
//!
//! Domain-specific error types for agrilink-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  agrilink-core errors (this file)                                      │
//! │  ├── CoreError        - Topic, identity and payload failures           │
//! │  └── ValidationError  - Field-level input validation failures          │
//! │                                                                         │
//! │  agrilink-db errors (separate crate)                                   │
//! │  └── DbError          - Outbox storage failures                        │
//! │                                                                         │
//! │  agrilink-sync errors                                                  │
//! │  └── SyncError        - What devices and operators see                 │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → gateway error body    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// None of these are retryable: a malformed topic or an oversized payload
/// will be just as malformed on the next attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Topic does not follow `iot/telemetry/{tenant}/{farm}/{barn}/{device}/{metric}`.
    ///
    /// ## When This Occurs
    /// - Wrong number of segments
    /// - Empty segment (`iot/telemetry/t1//b1/dev-7/temp`)
    /// - Wildcards in a publish topic
    /// - Non-ASCII or whitespace characters
    #[error("Malformed topic '{topic}': {reason}")]
    MalformedTopic { topic: String, reason: String },

    /// A device identity was provisioned with an unusable topic pattern.
    #[error("Invalid device identity '{username}': {reason}")]
    InvalidIdentity { username: String, reason: String },

    /// Payload has zero bytes.
    #[error("Payload is empty")]
    EmptyPayload,

    /// Payload exceeds the configured bound.
    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MalformedTopic error.
    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., embedded delimiter, non-ASCII).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::PayloadTooLarge { size: 300, max: 256 };
        assert_eq!(
            err.to_string(),
            "Payload of 300 bytes exceeds maximum of 256 bytes"
        );

        let err = CoreError::malformed("iot/x", "expected 7 segments, got 2");
        assert!(err.to_string().contains("iot/x"));
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "device_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
