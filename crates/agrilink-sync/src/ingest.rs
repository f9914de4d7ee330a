//! # Telemetry Ingestion
//!
//! Accepts a device publish, authorizes it and appends it durably to the
//! outbox. Never touches the network.
//!
//! ## Ingestion Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ingestion Flow                                   │
//! │                                                                         │
//! │  publish(identity, topic, payload, headers)                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  authorize(Publish) ──► Deny ──► Unauthorized (warn!, nothing stored)  │
//! │       │            └──► MalformedTopic                                  │
//! │       ▼                                                                 │
//! │  validate payload ──► EmptyPayload / PayloadTooLarge                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  correlation id = x-request-id or new UUID v4                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  outbox.append() ──► StorageFull / StorageUnavailable                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  notify forwarder, return record (Pending, next sequence)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use agrilink_core::validation::validate_payload;
use agrilink_core::{
    authorize, AuthDecision, CorrelationContext, DenyReason, DeviceIdentity, NewOutboxRecord,
    OutboxRecord, TelemetryTopic, TopicAction, TopicAuthorizer,
};
use agrilink_db::OutboxRepository;

use crate::error::{SyncError, SyncResult};

/// Authorizes and stores device telemetry.
#[derive(Debug, Clone)]
pub struct IngestionService {
    outbox: OutboxRepository,
    authorizer: TopicAuthorizer,
    max_payload_bytes: usize,
    new_records: Arc<Notify>,
}

impl IngestionService {
    pub fn new(
        outbox: OutboxRepository,
        authorizer: TopicAuthorizer,
        max_payload_bytes: usize,
        new_records: Arc<Notify>,
    ) -> Self {
        IngestionService {
            outbox,
            authorizer,
            max_payload_bytes,
            new_records,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Trigger signalled after every successful append.
    pub fn new_records(&self) -> Arc<Notify> {
        self.new_records.clone()
    }

    /// Ingests a publish from an already-resolved identity.
    pub async fn ingest(
        &self,
        identity: &DeviceIdentity,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        correlation: &CorrelationContext,
    ) -> SyncResult<OutboxRecord> {
        match authorize(identity, topic, TopicAction::Publish)? {
            AuthDecision::Allow => {}
            AuthDecision::Deny(reason) => {
                return Err(self.denied(identity.username(), topic, reason, correlation));
            }
        }

        validate_payload(payload, self.max_payload_bytes)?;

        let parsed = TelemetryTopic::parse(topic)?;
        let record = NewOutboxRecord {
            topic: parsed.to_string(),
            tenant_id: parsed.tenant_id,
            device_id: parsed.device_id,
            payload: payload.to_vec(),
            captured_at: received_at,
            correlation_id: correlation.correlation_id(),
        };

        let stored = self.outbox.append(record).await?;
        self.new_records.notify_one();

        debug!(
            id = stored.id,
            sequence = stored.sequence,
            device_id = %stored.device_id,
            correlation_id = %stored.correlation_id,
            bytes = payload.len(),
            "Telemetry ingested"
        );

        Ok(stored)
    }

    /// Ingests a publish identified only by the broker username.
    pub async fn ingest_as(
        &self,
        username: &str,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
        correlation: &CorrelationContext,
    ) -> SyncResult<OutboxRecord> {
        match self.authorizer.identity(username) {
            Some(identity) => {
                self.ingest(&identity, topic, payload, received_at, correlation)
                    .await
            }
            None => match self
                .authorizer
                .authorize_username(username, topic, TopicAction::Publish)?
            {
                AuthDecision::Deny(reason) => {
                    Err(self.denied(username, topic, reason, correlation))
                }
                // The lookup is read-only; a credential appearing between the
                // two calls is treated as unknown for this publish.
                AuthDecision::Allow => Err(self.denied(
                    username,
                    topic,
                    DenyReason::UnknownDevice,
                    correlation,
                )),
            },
        }
    }

    fn denied(
        &self,
        username: &str,
        topic: &str,
        reason: DenyReason,
        correlation: &CorrelationContext,
    ) -> SyncError {
        warn!(
            username = %username,
            topic = %topic,
            reason = %reason,
            request_id = ?correlation.request_id,
            "Publish denied"
        );
        SyncError::Unauthorized {
            username: username.to_string(),
            topic: topic.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agrilink_core::{InMemoryCredentialStore, SyncStatus};
    use agrilink_db::{Database, DbConfig};

    async fn setup() -> (Database, IngestionService) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = InMemoryCredentialStore::new([DeviceIdentity::for_device("t1", "dev-7").unwrap()]);
        let service = IngestionService::new(
            db.outbox(),
            TopicAuthorizer::new(Arc::new(store)),
            1024,
            Arc::new(Notify::new()),
        );
        (db, service)
    }

    fn dev7() -> DeviceIdentity {
        DeviceIdentity::for_device("t1", "dev-7").unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_appends_pending_record() {
        let (db, service) = setup().await;
        let correlation = CorrelationContext::from_headers([("x-request-id", "req-42")]);

        let record = service
            .ingest(
                &dev7(),
                "iot/telemetry/t1/f1/b1/dev-7/temperature",
                br#"{"celsius":21.5}"#,
                Utc::now(),
                &correlation,
            )
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.sequence, 1);
        assert_eq!(record.tenant_id, "t1");
        assert_eq!(record.device_id, "dev-7");
        assert_eq!(record.correlation_id, "req-42");

        let stored = db.outbox().get(record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);

        // The forwarder was signalled
        tokio::time::timeout(Duration::from_millis(50), service.new_records().notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_generates_correlation_id() {
        let (_db, service) = setup().await;

        let record = service
            .ingest(
                &dev7(),
                "iot/telemetry/t1/f1/b1/dev-7/humidity",
                b"55",
                Utc::now(),
                &CorrelationContext::default(),
            )
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&record.correlation_id).is_ok());
    }

    #[tokio::test]
    async fn test_spoofed_device_creates_no_record() {
        let (db, service) = setup().await;

        let err = service
            .ingest(
                &dev7(),
                "iot/telemetry/t1/f1/b1/dev-9/temperature",
                b"21.5",
                Utc::now(),
                &CorrelationContext::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::Unauthorized {
                reason: DenyReason::DeviceMismatch,
                ..
            }
        ));
        let stats = db.outbox().count_by_status().await.unwrap();
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (_db, service) = setup().await;
        let ctx = CorrelationContext::default();

        assert!(matches!(
            service
                .ingest(&dev7(), "iot/telemetry/t1/f1/dev-7/temperature", b"1", Utc::now(), &ctx)
                .await,
            Err(SyncError::MalformedTopic { .. })
        ));
        assert!(matches!(
            service
                .ingest(&dev7(), "iot/telemetry/t1/f1/b1/dev-7/temperature", b"", Utc::now(), &ctx)
                .await,
            Err(SyncError::EmptyPayload)
        ));
        assert!(matches!(
            service
                .ingest(&dev7(), "iot/telemetry/t1/f1/b1/dev-7/temperature", &[0u8; 1025], Utc::now(), &ctx)
                .await,
            Err(SyncError::PayloadTooLarge { size: 1025, max: 1024 })
        ));
        assert!(matches!(
            service
                .ingest(&dev7(), "iot/telemetry/t2/f1/b1/dev-7/temperature", b"1", Utc::now(), &ctx)
                .await,
            Err(SyncError::Unauthorized {
                reason: DenyReason::TenantMismatch,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ingest_by_username() {
        let (_db, service) = setup().await;
        let ctx = CorrelationContext::default();

        let record = service
            .ingest_as("dev-7", "iot/telemetry/t1/f2/b9/dev-7/co2", b"400", Utc::now(), &ctx)
            .await
            .unwrap();
        assert_eq!(record.topic, "iot/telemetry/t1/f2/b9/dev-7/co2");

        assert!(matches!(
            service
                .ingest_as("ghost", "iot/telemetry/t1/f1/b1/ghost/co2", b"400", Utc::now(), &ctx)
                .await,
            Err(SyncError::Unauthorized {
                reason: DenyReason::UnknownDevice,
                ..
            })
        ));
        assert!(matches!(
            service
                .ingest_as("ghost", "iot/telemetry", b"400", Utc::now(), &ctx)
                .await,
            Err(SyncError::MalformedTopic { .. })
        ));
    }

    #[tokio::test]
    async fn test_storage_unavailable_is_reported() {
        let (db, service) = setup().await;
        db.close().await;

        assert!(matches!(
            service
                .ingest(
                    &dev7(),
                    "iot/telemetry/t1/f1/b1/dev-7/temperature",
                    b"1",
                    Utc::now(),
                    &CorrelationContext::default()
                )
                .await,
            Err(SyncError::StorageUnavailable(_))
        ));
    }
}
