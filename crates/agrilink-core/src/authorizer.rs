//! # Topic Authorizer
//!
//! Decides whether a device identity may publish to, or subscribe on, a
//! telemetry topic.
//!
//! ## Decision Order
//! ```text
//! topic ──parse──► MalformedTopic (error)
//!   │
//!   ├── device segment ≠ provisioned device  ──► Deny(DeviceMismatch)
//!   ├── tenant segment ≠ provisioned tenant  ──► Deny(TenantMismatch)
//!   ├── outside allowed pattern              ──► Deny(PatternMismatch)
//!   └── otherwise                            ──► Allow
//! ```
//!
//! The device check runs first: a device claiming another device id is a
//! spoof no matter which tenant, farm or barn it names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::topic::{FilterSegment, TelemetryTopic, TopicFilter};
use crate::types::{DeviceIdentity, TopicAction};

// =============================================================================
// Decision Types
// =============================================================================

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The topic names a device other than the provisioned one.
    DeviceMismatch,
    /// The topic names a tenant other than the provisioned one.
    TenantMismatch,
    /// Farm, barn or metric falls outside the allowed pattern.
    PatternMismatch,
    /// No credential is provisioned for the username.
    UnknownDevice,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenyReason::DeviceMismatch => "device_mismatch",
            DenyReason::TenantMismatch => "tenant_mismatch",
            DenyReason::PatternMismatch => "pattern_mismatch",
            DenyReason::UnknownDevice => "unknown_device",
        };
        f.write_str(text)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(DenyReason),
}

impl AuthDecision {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

// =============================================================================
// Pure Authorization
// =============================================================================

/// Authorizes `identity` to perform `action` on `topic`.
///
/// Publish requires a concrete topic. Subscribe accepts a filter where farm,
/// barn and metric may be `+` and the metric may be `#`.
///
/// ## Errors
/// `MalformedTopic` if the topic (or filter) cannot be parsed.
pub fn authorize(
    identity: &DeviceIdentity,
    topic: &str,
    action: TopicAction,
) -> CoreResult<AuthDecision> {
    let requested = match action {
        TopicAction::Publish => TopicFilter::from(&TelemetryTopic::parse(topic)?),
        TopicAction::Subscribe => TopicFilter::parse(topic)?,
    };

    Ok(decide(identity, &requested))
}

fn decide(identity: &DeviceIdentity, requested: &TopicFilter) -> AuthDecision {
    // A wildcard device or tenant never equals a provisioned literal.
    if !literal_eq(requested.device(), identity.device_id()) {
        return AuthDecision::Deny(DenyReason::DeviceMismatch);
    }

    if !literal_eq(requested.tenant(), identity.tenant_id()) {
        return AuthDecision::Deny(DenyReason::TenantMismatch);
    }

    if !identity.allowed_topic_pattern().covers(requested) {
        return AuthDecision::Deny(DenyReason::PatternMismatch);
    }

    AuthDecision::Allow
}

fn literal_eq(segment: &FilterSegment, expected: &str) -> bool {
    segment.literal() == Some(expected)
}

// =============================================================================
// Credential Lookup
// =============================================================================

/// Read-only access to provisioned device credentials.
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, username: &str) -> Option<DeviceIdentity>;
}

/// Credential store backed by a map, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    identities: HashMap<String, DeviceIdentity>,
}

impl InMemoryCredentialStore {
    pub fn new(identities: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        InMemoryCredentialStore {
            identities: identities
                .into_iter()
                .map(|identity| (identity.username().to_string(), identity))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl CredentialLookup for InMemoryCredentialStore {
    fn lookup(&self, username: &str) -> Option<DeviceIdentity> {
        self.identities.get(username).cloned()
    }
}

/// Authorizer bound to a credential source.
#[derive(Clone)]
pub struct TopicAuthorizer {
    credentials: Arc<dyn CredentialLookup>,
}

impl TopicAuthorizer {
    pub fn new(credentials: Arc<dyn CredentialLookup>) -> Self {
        TopicAuthorizer { credentials }
    }

    /// Looks up the identity for `username`.
    pub fn identity(&self, username: &str) -> Option<DeviceIdentity> {
        self.credentials.lookup(username)
    }

    /// Authorizes by username; an unknown username is `Deny(UnknownDevice)`.
    ///
    /// The topic is still parsed for unknown usernames so malformed requests
    /// are reported as such.
    pub fn authorize_username(
        &self,
        username: &str,
        topic: &str,
        action: TopicAction,
    ) -> CoreResult<AuthDecision> {
        match self.credentials.lookup(username) {
            Some(identity) => authorize(&identity, topic, action),
            None => {
                match action {
                    TopicAction::Publish => TelemetryTopic::parse(topic).map(|_| ())?,
                    TopicAction::Subscribe => TopicFilter::parse(topic).map(|_| ())?,
                }
                Ok(AuthDecision::Deny(DenyReason::UnknownDevice))
            }
        }
    }
}

impl fmt::Debug for TopicAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicAuthorizer").finish_non_exhaustive()
    }
}
