//! # Sync Error Types
//!
//! Error types for ingestion, forwarding and configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Ingestion     │  │     Storage             │ │
//! │  │                 │  │  (to devices)   │  │                         │ │
//! │  │  InvalidConfig  │  │  MalformedTopic │  │  StorageUnavailable     │ │
//! │  │  InvalidUrl     │  │  Unauthorized   │  │  StorageFull            │ │
//! │  │  ConfigLoad..   │  │  EmptyPayload   │  │  DatabaseError          │ │
//! │  │                 │  │  PayloadTooLarge│  │  NotFound               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Delivery     │  │      Internal                               │  │
//! │  │  (never seen by │  │                                             │  │
//! │  │   devices)      │  │  Internal, ShuttingDown, ChannelError       │  │
//! │  │  DeliveryFailure│  │                                             │  │
//! │  │  Timeout        │  │                                             │  │
//! │  │  InvalidResponse│  │                                             │  │
//! │  │  DeadLettered   │  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

use agrilink_core::{CoreError, DenyReason};
use agrilink_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure of the edge pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid cloud URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Ingestion Errors
    // =========================================================================
    /// Topic does not follow the telemetry layout.
    #[error("Malformed topic '{topic}': {reason}")]
    MalformedTopic { topic: String, reason: String },

    /// The device may not publish to this topic.
    #[error("Device '{username}' is not authorized for '{topic}': {reason}")]
    Unauthorized {
        username: String,
        topic: String,
        reason: DenyReason,
    },

    /// Payload has zero bytes.
    #[error("Payload is empty")]
    EmptyPayload,

    /// Payload exceeds the configured bound.
    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Outbox cannot be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Outbox cannot accept more records.
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Other database failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Delivery Errors
    // =========================================================================
    /// Cloud ingestion could not be reached or refused the batch.
    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    /// Send exceeded the configured timeout.
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    /// Cloud answered with a body we cannot interpret.
    #[error("Invalid cloud response: {0}")]
    InvalidResponse(String),

    /// Record gave up after exhausting its attempts.
    #[error("Record {id} dead-lettered: {last_error}")]
    DeadLettered { id: i64, last_error: String },

    /// Failed to serialize a request.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Edge agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MalformedTopic { topic, reason } => {
                SyncError::MalformedTopic { topic, reason }
            }
            CoreError::EmptyPayload => SyncError::EmptyPayload,
            CoreError::PayloadTooLarge { size, max } => SyncError::PayloadTooLarge { size, max },
            CoreError::InvalidIdentity { username, reason } => {
                SyncError::InvalidConfig(format!("device '{}': {}", username, reason))
            }
            CoreError::Validation(e) => SyncError::MalformedTopic {
                topic: String::new(),
                reason: e.to_string(),
            },
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::StorageFull(msg) => SyncError::StorageFull(msg),
            DbError::StorageUnavailable(msg) => SyncError::StorageUnavailable(msg),
            DbError::NotFound { entity, id } => SyncError::NotFound(format!("{} {}", entity, id)),
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::DeliveryFailure(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if a later attempt of the same operation may succeed.
    ///
    /// ## Retryable Errors
    /// - Delivery failures and timeouts (network issues)
    /// - Storage unavailable or full (transient on the edge node)
    ///
    /// ## Non-Retryable Errors
    /// - Malformed or unauthorized publishes
    /// - Payload bounds
    /// - Configuration errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::DeliveryFailure(_)
                | SyncError::Timeout(_)
                | SyncError::InvalidResponse(_)
                | SyncError::StorageUnavailable(_)
                | SyncError::StorageFull(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_) | SyncError::InvalidUrl(_) | SyncError::ConfigLoadFailed(_)
        )
    }

    /// Stable machine-readable code, used in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidConfig(_) => "INVALID_CONFIG",
            SyncError::InvalidUrl(_) => "INVALID_URL",
            SyncError::ConfigLoadFailed(_) => "CONFIG_LOAD_FAILED",
            SyncError::MalformedTopic { .. } => "MALFORMED_TOPIC",
            SyncError::Unauthorized { .. } => "UNAUTHORIZED",
            SyncError::EmptyPayload => "EMPTY_PAYLOAD",
            SyncError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            SyncError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            SyncError::StorageFull(_) => "STORAGE_FULL",
            SyncError::DatabaseError(_) => "DATABASE_ERROR",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::DeliveryFailure(_) => "DELIVERY_FAILURE",
            SyncError::Timeout(_) => "TIMEOUT",
            SyncError::InvalidResponse(_) => "INVALID_RESPONSE",
            SyncError::DeadLettered { .. } => "DEAD_LETTERED",
            SyncError::SerializationFailed(_) => "SERIALIZATION_FAILED",
            SyncError::Internal(_) => "INTERNAL",
            SyncError::ShuttingDown => "SHUTTING_DOWN",
            SyncError::ChannelError(_) => "CHANNEL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::DeliveryFailure("connection refused".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(SyncError::StorageUnavailable("pool closed".into()).is_retryable());

        assert!(!SyncError::EmptyPayload.is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::Unauthorized {
            username: "dev-7".into(),
            topic: "iot/telemetry/t1/f1/b1/dev-9/temp".into(),
            reason: DenyReason::DeviceMismatch,
        }
        .is_retryable());
    }

    #[test]
    fn test_core_error_mapping() {
        let err: SyncError = CoreError::PayloadTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, SyncError::PayloadTooLarge { size: 10, max: 5 }));
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");

        let err: SyncError = CoreError::malformed("iot/x", "too short").into();
        assert_eq!(err.code(), "MALFORMED_TOPIC");
    }

    #[test]
    fn test_db_error_mapping() {
        let err: SyncError = DbError::StorageFull("disk".into()).into();
        assert!(matches!(err, SyncError::StorageFull(_)));

        let err: SyncError = DbError::StorageUnavailable("closed".into()).into();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");

        let err: SyncError = DbError::QueryFailed("syntax".into()).into();
        assert!(matches!(err, SyncError::DatabaseError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Unauthorized {
            username: "dev-7".into(),
            topic: "iot/telemetry/t1/f1/b1/dev-9/temp".into(),
            reason: DenyReason::DeviceMismatch,
        };
        assert!(err.to_string().contains("device_mismatch"));
        assert!(err.to_string().contains("dev-9"));

        let err = SyncError::Timeout(Duration::from_millis(100));
        assert_eq!(err.to_string(), "Delivery timed out after 100ms");
    }
}
