//! # Domain Types
//!
//! Core domain types used throughout the AgriLink edge.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ DeviceIdentity  │   │  OutboxRecord   │   │   SyncStatus    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  username       │   │  id (global)    │   │  Pending        │       │
//! │  │  allowed_topic_ │   │  sequence (dev) │   │  InFlight       │       │
//! │  │    pattern      │   │  payload bytes  │   │  Acked          │       │
//! │  └─────────────────┘   │  sync_status    │   │  DeadLettered   │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                             │
//! │  │ NewOutboxRecord │   │  OutboxStats    │                             │
//! │  │  (pre-append)   │   │  counts/status  │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Record Identity
//! Every outbox record has:
//! - `id`: outbox-wide, strictly increasing; used for leasing, acks and the
//!   cloud contract
//! - `sequence`: per-device gapless counter starting at 1

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::topic::{FilterSegment, TopicFilter};

// =============================================================================
// Topic Action
// =============================================================================

/// What a device wants to do with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicAction {
    Publish,
    Subscribe,
}

// =============================================================================
// Device Identity
// =============================================================================

/// A provisioned device credential.
///
/// The allowed pattern must name a literal tenant and a literal device id;
/// those two segments are the device's provisioned tenant and device id.
///
/// ## Example
/// ```rust
/// use agrilink_core::types::DeviceIdentity;
///
/// let identity = DeviceIdentity::new("barn-sensor-7", "iot/telemetry/t1/f1/+/dev-7/#").unwrap();
/// assert_eq!(identity.tenant_id(), "t1");
/// assert_eq!(identity.device_id(), "dev-7");
///
/// // Wildcard device segments cannot be provisioned
/// assert!(DeviceIdentity::new("any", "iot/telemetry/t1/+/+/+/#").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDeviceIdentity", into = "RawDeviceIdentity")]
pub struct DeviceIdentity {
    username: String,
    allowed_topic_pattern: TopicFilter,
    tenant_id: String,
    device_id: String,
}

impl DeviceIdentity {
    /// Creates an identity, rejecting patterns without a literal tenant and device.
    pub fn new(username: impl Into<String>, allowed_topic_pattern: &str) -> CoreResult<Self> {
        let username = username.into();
        if username.is_empty() {
            return Err(CoreError::InvalidIdentity {
                username,
                reason: "username is required".to_string(),
            });
        }

        let filter = TopicFilter::parse(allowed_topic_pattern).map_err(|e| {
            CoreError::InvalidIdentity {
                username: username.clone(),
                reason: e.to_string(),
            }
        })?;

        let literal = |segment: &FilterSegment, what: &str| {
            segment
                .literal()
                .map(str::to_string)
                .ok_or_else(|| CoreError::InvalidIdentity {
                    username: username.clone(),
                    reason: format!("{} segment must not be a wildcard", what),
                })
        };
        let tenant_id = literal(filter.tenant(), "tenant")?;
        let device_id = literal(filter.device(), "device")?;

        Ok(DeviceIdentity {
            username,
            allowed_topic_pattern: filter,
            tenant_id,
            device_id,
        })
    }

    /// Identity whose username is the device id and which may publish any
    /// metric from any farm or barn of its tenant.
    pub fn for_device(tenant_id: &str, device_id: &str) -> CoreResult<Self> {
        DeviceIdentity::new(
            device_id,
            &format!("iot/telemetry/{}/+/+/{}/+", tenant_id, device_id),
        )
    }

    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[inline]
    pub fn allowed_topic_pattern(&self) -> &TopicFilter {
        &self.allowed_topic_pattern
    }

    /// The provisioned tenant.
    #[inline]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The provisioned device id.
    #[inline]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Serialized form of [`DeviceIdentity`], as written in `[[devices]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDeviceIdentity {
    username: String,
    allowed_topic_pattern: String,
}

impl TryFrom<RawDeviceIdentity> for DeviceIdentity {
    type Error = CoreError;

    fn try_from(raw: RawDeviceIdentity) -> Result<Self, Self::Error> {
        DeviceIdentity::new(raw.username, &raw.allowed_topic_pattern)
    }
}

impl From<DeviceIdentity> for RawDeviceIdentity {
    fn from(identity: DeviceIdentity) -> Self {
        RawDeviceIdentity {
            allowed_topic_pattern: identity.allowed_topic_pattern.to_string(),
            username: identity.username,
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Delivery state of an outbox record.
///
/// ```text
/// Pending ──lease──► InFlight ──ack──► Acked
///    ▲                  │
///    └──retry/recover───┤
///                       └──retry past max attempts──► DeadLettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting to be leased.
    Pending,
    /// Leased by the forwarder, delivery in progress.
    InFlight,
    /// Confirmed by the cloud.
    Acked,
    /// Gave up after too many failed attempts.
    DeadLettered,
}

impl SyncStatus {
    /// Storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InFlight => "in_flight",
            SyncStatus::Acked => "acked",
            SyncStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Acked and DeadLettered are never touched by the forwarder again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Acked | SyncStatus::DeadLettered)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Pending
    }
}

// =============================================================================
// Outbox Record
// =============================================================================

/// A record ready to be appended to the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    pub tenant_id: String,
    pub device_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub correlation_id: String,
}

/// A durable telemetry message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct OutboxRecord {
    /// Outbox-wide, strictly increasing.
    pub id: i64,
    /// Per-device gapless counter, starting at 1.
    pub sequence: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub acked_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Payload size in bytes, as counted against batch limits.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

// =============================================================================
// Outbox Stats
// =============================================================================

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStats {
    pub pending: u64,
    pub in_flight: u64,
    pub acked: u64,
    pub dead_lettered: u64,
}

impl OutboxStats {
    /// Records that still count against storage capacity.
    pub fn unresolved(&self) -> u64 {
        self.pending + self.in_flight + self.dead_lettered
    }
}
