//! # Edge Agent
//!
//! Main orchestrator for the edge node. Wires ingestion, the forwarder and
//! the publish gateway around one outbox.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EdgeAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         EdgeAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • Owns the new-record Notify shared by ingestion and forwarder │  │
//! │  │  • Spawns the forwarder task and the gateway server              │  │
//! │  │  • Stops the gateway first, then lets the forwarder finish      │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Gateway      │  │  Ingestion     │  │   Forwarder            │    │
//! │  │   (axum)       │─►│  Service       │  │                        │    │
//! │  │                │  │                │  │ Drains the outbox to   │    │
//! │  │ POST /publish  │  │ authorize +    │  │ cloud ingestion        │    │
//! │  │                │  │ append         │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └───────────▲────────────┘    │
//! │                              │      notify_one()     │                 │
//! │                              └───────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use agrilink_core::{OutboxStats, TopicAuthorizer};
use agrilink_db::Database;

use crate::cloud_client::{HttpIngestClient, IngestClient};
use crate::config::EdgeConfig;
use crate::error::{SyncError, SyncResult};
use crate::forwarder::{
    Forwarder, ForwarderConfig, ForwarderEventEmitter, ForwarderHandle, ForwarderPhase,
    NoOpEmitter,
};
use crate::gateway::{Gateway, GatewayHandle};
use crate::ingest::IngestionService;

// =============================================================================
// Agent Status
// =============================================================================

/// Snapshot of the agent for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub node_id: String,
    pub running: bool,
    pub forwarder_phase: String,
    pub gateway_addr: Option<SocketAddr>,
    pub outbox: OutboxStats,
}

// =============================================================================
// Edge Agent
// =============================================================================

/// Runs the edge sync pipeline.
pub struct EdgeAgent {
    config: Arc<EdgeConfig>,
    db: Database,
    client: Arc<dyn IngestClient>,
    emitter: Arc<dyn ForwarderEventEmitter>,
    ingest: IngestionService,
    forwarder: Option<(ForwarderHandle, JoinHandle<()>)>,
    gateway: Option<GatewayHandle>,
}

impl EdgeAgent {
    /// Creates an agent delivering to the configured cloud URL.
    pub fn new(config: EdgeConfig, db: Database) -> SyncResult<Self> {
        EdgeAgentBuilder::new(config).with_database(db).build()
    }

    fn with_parts(
        config: EdgeConfig,
        db: Database,
        client: Arc<dyn IngestClient>,
        emitter: Arc<dyn ForwarderEventEmitter>,
    ) -> Self {
        let authorizer = TopicAuthorizer::new(Arc::new(config.credential_store()));
        let ingest = IngestionService::new(
            db.outbox(),
            authorizer,
            config.ingest.max_payload_bytes,
            Arc::new(Notify::new()),
        );

        EdgeAgent {
            config: Arc::new(config),
            db,
            client,
            emitter,
            ingest,
            forwarder: None,
            gateway: None,
        }
    }

    /// Ingestion entry point for in-process publishers.
    pub fn ingestion(&self) -> IngestionService {
        self.ingest.clone()
    }

    /// Address of the running gateway, if started.
    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway.as_ref().map(GatewayHandle::local_addr)
    }

    pub async fn status(&self) -> SyncResult<AgentStatus> {
        let outbox = self.db.outbox().count_by_status().await?;
        let phase = self
            .forwarder
            .as_ref()
            .map(|(handle, _)| handle.phase())
            .unwrap_or(ForwarderPhase::Idle);

        Ok(AgentStatus {
            node_id: self.config.node.id.clone(),
            running: self.forwarder.is_some(),
            forwarder_phase: phase.to_string(),
            gateway_addr: self.gateway_addr(),
            outbox,
        })
    }

    /// Starts the forwarder and, if enabled, the gateway.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.forwarder.is_some() {
            return Err(SyncError::Internal("Edge agent already started".into()));
        }

        self.config.validate()?;

        info!(
            node_id = %self.config.node.id,
            cloud_url = %self.config.forwarder.cloud_url,
            devices = self.config.devices.len(),
            "Starting edge agent"
        );

        let (forwarder, forwarder_handle) = Forwarder::new(
            self.db.outbox(),
            self.client.clone(),
            ForwarderConfig::from_config(&self.config),
            self.ingest.new_records(),
            self.emitter.clone(),
        );
        let task = tokio::spawn(forwarder.run());
        self.forwarder = Some((forwarder_handle, task));

        if self.config.gateway.enabled {
            let gateway = Gateway::new(
                self.config.gateway.bind_address(),
                self.ingest.clone(),
                self.db.clone(),
            );
            match gateway.start().await {
                Ok(handle) => self.gateway = Some(handle),
                Err(e) => {
                    // Leave nothing half-running
                    self.shutdown().await?;
                    return Err(e);
                }
            }
        }

        info!("Edge agent started");
        Ok(())
    }

    /// Stops the gateway, then waits for the forwarder to finish its cycle.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down edge agent");

        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown().await;
        }

        if let Some((handle, task)) = self.forwarder.take() {
            handle.shutdown();
            if let Err(e) = task.await {
                error!(?e, "Forwarder task failed");
                return Err(SyncError::Internal(format!("Forwarder task failed: {}", e)));
            }
        }

        info!("Edge agent stopped");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating an EdgeAgent with options.
pub struct EdgeAgentBuilder {
    config: EdgeConfig,
    db: Option<Database>,
    client: Option<Arc<dyn IngestClient>>,
    emitter: Option<Arc<dyn ForwarderEventEmitter>>,
}

impl EdgeAgentBuilder {
    pub fn new(config: EdgeConfig) -> Self {
        EdgeAgentBuilder {
            config,
            db: None,
            client: None,
            emitter: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Replaces the HTTP client, e.g. with a fake in tests.
    pub fn with_client(mut self, client: Arc<dyn IngestClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn ForwarderEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<EdgeAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        let client = match self.client {
            Some(client) => client,
            None => Arc::new(HttpIngestClient::from_config(&self.config)?),
        };
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(EdgeAgent::with_parts(self.config, db, client, emitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use agrilink_core::{CorrelationContext, DeviceIdentity};
    use agrilink_db::DbConfig;

    use crate::gateway::DEVICE_USERNAME_HEADER;
    use crate::protocol::{DeliveryReport, IngestBatch};

    struct AcceptAll;

    #[async_trait]
    impl IngestClient for AcceptAll {
        async fn send(&self, batch: &IngestBatch) -> SyncResult<DeliveryReport> {
            Ok(DeliveryReport::all_accepted(batch))
        }
    }

    fn config(gateway: bool) -> EdgeConfig {
        let mut config = EdgeConfig::default();
        config.gateway.enabled = gateway;
        config.gateway.port = 0;
        config.forwarder.poll_interval_ms = 20;
        config
            .devices
            .push(DeviceIdentity::for_device("t1", "dev-7").unwrap());
        config
    }

    async fn agent(gateway: bool) -> (Database, EdgeAgent) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let agent = EdgeAgentBuilder::new(config(gateway))
            .with_database(db.clone())
            .with_client(Arc::new(AcceptAll))
            .build()
            .unwrap();
        (db, agent)
    }

    async fn wait_for_acked(db: &Database, expected: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while db.outbox().count_by_status().await.unwrap().acked < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_builder_requires_database() {
        assert!(matches!(
            EdgeAgentBuilder::new(EdgeConfig::default()).build(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_through_gateway_is_delivered() {
        let (db, mut agent) = agent(true).await;
        agent.start().await.unwrap();

        let addr = agent.gateway_addr().unwrap();
        let response = reqwest::Client::new()
            .post(format!(
                "http://{}/publish/iot/telemetry/t1/f1/b1/dev-7/temperature",
                addr
            ))
            .header(DEVICE_USERNAME_HEADER, "dev-7")
            .body(r#"{"v":21.5}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 202);

        wait_for_acked(&db, 1).await;

        let status = agent.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.outbox.acked, 1);

        agent.shutdown().await.unwrap();
        assert!(!agent.status().await.unwrap().running);
        assert!(agent.gateway_addr().is_none());
    }

    #[tokio::test]
    async fn test_in_process_ingestion_without_gateway() {
        let (db, mut agent) = agent(false).await;
        agent.start().await.unwrap();
        assert!(agent.gateway_addr().is_none());

        agent
            .ingestion()
            .ingest_as(
                "dev-7",
                "iot/telemetry/t1/f1/b1/dev-7/humidity",
                b"55",
                Utc::now(),
                &CorrelationContext::default(),
            )
            .await
            .unwrap();

        wait_for_acked(&db, 1).await;

        assert!(agent.start().await.is_err());
        agent.shutdown().await.unwrap();
    }
}
