//! # agrilink-sync: Edge Sync Engine for AgriLink
//!
//! This crate moves device telemetry from the edge node to cloud ingestion,
//! buffering it durably so nothing is lost while the uplink is down.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Edge Sync Architecture                           │
//! │                                                                         │
//! │  Device ──► broker bridge ──► Gateway ──► IngestionService             │
//! │                                              │                          │
//! │                               authorize ◄────┤ (agrilink-core)          │
//! │                                              │                          │
//! │                                              ▼                          │
//! │                                   ┌─────────────────────┐              │
//! │                                   │  Outbox (SQLite)    │              │
//! │                                   │  agrilink-db        │              │
//! │                                   └──────────┬──────────┘              │
//! │                                              │ lease / ack / retry      │
//! │                                              ▼                          │
//! │                                   ┌─────────────────────┐              │
//! │                                   │     Forwarder       │              │
//! │                                   │ backoff, dead-letter│              │
//! │                                   └──────────┬──────────┘              │
//! │                                              │ HttpIngestClient         │
//! │                                              ▼                          │
//! │                                   POST {cloud_url}/ingest               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `EdgeAgent` orchestrator
//! - [`config`] - Edge configuration (TOML + `AGRILINK_*` env)
//! - [`error`] - Sync error types
//! - [`ingest`] - Authorized, durable ingestion of device publishes
//! - [`forwarder`] - Outbox drain loop with retry and backoff
//! - [`cloud_client`] - reqwest client for cloud ingestion
//! - [`gateway`] - axum publish gateway
//! - [`protocol`] - Wire types for cloud ingestion and the gateway
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agrilink_sync::{EdgeAgent, EdgeConfig};
//! use agrilink_db::Database;
//!
//! let config = EdgeConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//!
//! let mut agent = EdgeAgent::new(config, db)?;
//! agent.start().await?;
//!
//! let status = agent.status().await?;
//! println!("Pending: {}", status.outbox.pending);
//!
//! agent.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cloud_client;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod ingest;
pub mod protocol;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, EdgeAgent, EdgeAgentBuilder};
pub use cloud_client::{HttpIngestClient, IngestClient};
pub use config::EdgeConfig;
pub use error::{SyncError, SyncResult};
pub use forwarder::{
    CycleOutcome, Forwarder, ForwarderConfig, ForwarderEventEmitter, ForwarderHandle,
    ForwarderPhase, NoOpEmitter,
};
pub use gateway::{Gateway, GatewayHandle, DEVICE_USERNAME_HEADER};
pub use ingest::IngestionService;
pub use protocol::{DeliveryReport, IngestBatch, IngestRecord};
