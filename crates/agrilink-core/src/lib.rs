//! # agrilink-core: Pure Domain Logic for the AgriLink Edge
//!
//! This crate holds every decision of the edge sync pipeline that can be made
//! without touching a disk or a socket.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      AgriLink Edge Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Devices (barn sensors, feeders, weather)             │   │
//! │  │        publish iot/telemetry/{tenant}/{farm}/{barn}/...         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ broker bridge                          │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              agrilink-sync (ingest, forwarder)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ agrilink-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌───────────┐ │   │
//! │  │   │   topic   │  │ authorizer │  │correlation │  │validation │ │   │
//! │  │   │  parsing  │  │ allow/deny │  │ request ids│  │ payloads  │ │   │
//! │  │   └───────────┘  └────────────┘  └────────────┘  └───────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                agrilink-db (durable outbox)                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Outbox records, sync status, device identities
//! - [`topic`] - Telemetry topic parsing and topic filters
//! - [`authorizer`] - Device-topic authorization decisions
//! - [`correlation`] - Correlation id propagation across the edge→cloud hop
//! - [`validation`] - Payload and identifier validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use agrilink_core::authorizer::{authorize, AuthDecision};
//! use agrilink_core::types::{DeviceIdentity, TopicAction};
//!
//! let identity = DeviceIdentity::for_device("t1", "dev-7").unwrap();
//! let decision = authorize(
//!     &identity,
//!     "iot/telemetry/t1/f1/b1/dev-7/temperature",
//!     TopicAction::Publish,
//! )
//! .unwrap();
//! assert_eq!(decision, AuthDecision::Allow);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod authorizer;
pub mod correlation;
pub mod error;
pub mod topic;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use authorizer::{authorize, AuthDecision, CredentialLookup, DenyReason, InMemoryCredentialStore, TopicAuthorizer};
pub use correlation::CorrelationContext;
pub use error::{CoreError, CoreResult, ValidationError};
pub use topic::{TelemetryTopic, TopicFilter};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// First segment of every telemetry topic.
pub const TOPIC_ROOT: &str = "iot";

/// Second segment of every telemetry topic.
pub const TOPIC_KIND: &str = "telemetry";

/// Number of `/`-separated segments in a telemetry topic.
pub const TOPIC_SEGMENTS: usize = 7;

/// Default upper bound for a single telemetry payload (256 KiB).
///
/// Barn sensors publish small JSON documents; anything near this size is
/// almost certainly a misbehaving device.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Maximum length of a tenant/farm/barn/device/metric segment.
pub const MAX_SEGMENT_LEN: usize = 128;
