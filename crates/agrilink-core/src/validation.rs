//! # Validation Module
//!
//! Input validation for topic segments and telemetry payloads.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Broker bridge / gateway                                      │
//! │  └── Header presence, body extraction                                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Segment rules (non-empty, ASCII, no delimiters)                   │
//! │  └── Payload bounds (non-empty, max size)                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Outbox (SQLite)                                              │
//! │  └── NOT NULL / CHECK constraints                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::MAX_SEGMENT_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates an opaque identifier segment (tenant, farm, barn, device, metric).
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_SEGMENT_LEN`] characters
/// - Printable ASCII only, no whitespace
/// - No topic delimiter (`/`) and no wildcard (`+`, `#`)
///
/// ## Example
/// ```rust
/// use agrilink_core::validation::validate_segment;
///
/// assert!(validate_segment("device_id", "dev-7").is_ok());
/// assert!(validate_segment("device_id", "").is_err());
/// assert!(validate_segment("device_id", "dev/7").is_err());
/// ```
pub fn validate_segment(field: &str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_SEGMENT_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_SEGMENT_LEN,
        });
    }

    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_graphic() || matches!(c, '/' | '+' | '#'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("character {:?} is not allowed", c),
        });
    }

    Ok(())
}

/// Validates a raw telemetry payload against the size bound.
///
/// ## Example
/// ```rust
/// use agrilink_core::validation::validate_payload;
/// use agrilink_core::CoreError;
///
/// assert!(validate_payload(br#"{"v":21.5}"#, 1024).is_ok());
/// assert_eq!(validate_payload(b"", 1024), Err(CoreError::EmptyPayload));
/// ```
pub fn validate_payload(payload: &[u8], max_bytes: usize) -> CoreResult<()> {
    if payload.is_empty() {
        return Err(CoreError::EmptyPayload);
    }

    if payload.len() > max_bytes {
        return Err(CoreError::PayloadTooLarge {
            size: payload.len(),
            max: max_bytes,
        });
    }

    Ok(())
}
