//! # Edge Configuration
//!
//! Configuration management for the edge node.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     AGRILINK_CLOUD_URL=https://ingest.agrilink.example                 │
//! │     AGRILINK_DATABASE_PATH=/var/lib/agrilink/outbox.db                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/agrilink-edge/edge.toml (Linux)                          │
//! │     ~/Library/Application Support/io.agrilink.edge/edge.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [node]
//! id = "edge-farm-12"
//!
//! [storage]
//! database_path = "/var/lib/agrilink/outbox.db"
//! max_attempts = 5
//! retention_hours = 24
//!
//! [forwarder]
//! cloud_url = "https://ingest.agrilink.example"
//! batch_size = 100
//! send_timeout_secs = 10
//!
//! [gateway]
//! port = 8787
//!
//! [[devices]]
//! username = "dev-7"
//! allowed_topic_pattern = "iot/telemetry/t1/+/+/dev-7/+"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agrilink_core::{DeviceIdentity, InMemoryCredentialStore, DEFAULT_MAX_PAYLOAD_BYTES};
use agrilink_db::{DbConfig, DEFAULT_MAX_ATTEMPTS};

use crate::error::{SyncError, SyncResult};

const CONFIG_FILE: &str = "edge.toml";
const DATABASE_FILE: &str = "outbox.db";

// =============================================================================
// Node Configuration
// =============================================================================

/// Identity of this edge node, used in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node identifier. Auto-generated if not provided.
    pub id: String,

    /// Human-readable name (e.g., "Farm 12 barn gateway").
    #[serde(default = "default_node_name")]
    pub name: String,
}

fn default_node_name() -> String {
    "AgriLink Edge".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            id: Uuid::new_v4().to_string(),
            name: default_node_name(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Outbox database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Failed attempts tolerated before a record is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Cap on unresolved records (None = limited by disk only).
    #[serde(default)]
    pub max_records: Option<u64>,

    /// How long acked records are kept before purging.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retention_hours() -> u64 {
    24
}
fn default_max_connections() -> u32 {
    5
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            max_attempts: default_max_attempts(),
            max_records: None,
            retention_hours: default_retention_hours(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Ingest Settings
// =============================================================================

/// Ingestion bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Largest accepted payload in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

// =============================================================================
// Forwarder Settings
// =============================================================================

/// Forwarder behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderSettings {
    /// Base URL of cloud ingestion; batches go to `{cloud_url}/ingest`.
    #[serde(default = "default_cloud_url")]
    pub cloud_url: String,

    /// Optional bearer token for cloud ingestion.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Maximum records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Maximum total payload bytes per batch.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Interval between idle poll cycles (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for one send (seconds).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// First backoff after a failed cycle (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// How often acked records are purged (seconds).
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_cloud_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_batch_size() -> u32 {
    100
}
fn default_max_batch_bytes() -> usize {
    1024 * 1024
}
fn default_poll_interval() -> u64 {
    2_000
}
fn default_send_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_purge_interval() -> u64 {
    300
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        ForwarderSettings {
            cloud_url: default_cloud_url(),
            auth_token: None,
            batch_size: default_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            poll_interval_ms: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl ForwarderSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

// =============================================================================
// Gateway Settings
// =============================================================================

/// Local publish gateway used by the broker bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Whether to start the HTTP gateway.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: loopback only).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for the HTTP server.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}
fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_gateway_port() -> u16 {
    8787
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            enabled: true,
            bind_addr: default_bind_addr(),
            port: default_gateway_port(),
        }
    }
}

impl GatewaySettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Main Edge Configuration
// =============================================================================

/// Complete edge node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub ingest: IngestSettings,

    #[serde(default)]
    pub forwarder: ForwarderSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Provisioned device credentials.
    #[serde(default)]
    pub devices: Vec<DeviceIdentity>,
}

impl EdgeConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (edge.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading edge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document.
    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.id.is_empty() {
            return Err(SyncError::InvalidConfig("node.id must not be empty".into()));
        }

        let url = url::Url::parse(&self.forwarder.cloud_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "cloud_url must start with http:// or https://, got: {}",
                self.forwarder.cloud_url
            )));
        }

        if self.forwarder.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "forwarder.batch_size must be greater than 0".into(),
            ));
        }

        if self.forwarder.send_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "forwarder.send_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.forwarder.poll_interval_ms == 0 || self.forwarder.purge_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "forwarder poll and purge intervals must be greater than 0".into(),
            ));
        }

        if self.forwarder.initial_backoff() > self.forwarder.max_backoff() {
            return Err(SyncError::InvalidConfig(
                "forwarder.initial_backoff_ms must not exceed max_backoff_secs".into(),
            ));
        }

        if self.ingest.max_payload_bytes == 0 {
            return Err(SyncError::InvalidConfig(
                "ingest.max_payload_bytes must be greater than 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.username()) {
                return Err(SyncError::InvalidConfig(format!(
                    "device '{}' is provisioned twice",
                    device.username()
                )));
            }
        }

        Ok(())
    }

    /// Applies `AGRILINK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("AGRILINK_NODE_ID") {
            debug!(node_id = %id, "Overriding node id from environment");
            self.node.id = id;
        }

        if let Some(path) = lookup("AGRILINK_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Some(url) = lookup("AGRILINK_CLOUD_URL") {
            debug!(url = %url, "Overriding cloud URL from environment");
            self.forwarder.cloud_url = url;
        }

        if let Some(token) = lookup("AGRILINK_CLOUD_TOKEN") {
            self.forwarder.auth_token = Some(token);
        }

        if let Some(value) = lookup("AGRILINK_BATCH_SIZE") {
            match value.parse::<u32>() {
                Ok(size) => self.forwarder.batch_size = size,
                Err(_) => warn!(value = %value, "Ignoring invalid AGRILINK_BATCH_SIZE"),
            }
        }

        if let Some(value) = lookup("AGRILINK_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(max) => self.storage.max_attempts = max,
                Err(_) => warn!(value = %value, "Ignoring invalid AGRILINK_MAX_ATTEMPTS"),
            }
        }

        if let Some(value) = lookup("AGRILINK_GATEWAY_PORT") {
            match value.parse::<u16>() {
                Ok(port) => {
                    debug!(port, "Overriding gateway port from environment");
                    self.gateway.port = port;
                }
                Err(_) => warn!(value = %value, "Ignoring invalid AGRILINK_GATEWAY_PORT"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "agrilink", "edge")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Database path: configured, else the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("io", "agrilink", "edge")
                .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
                .unwrap_or_else(|| PathBuf::from(DATABASE_FILE))
        })
    }

    /// Database configuration derived from the storage section.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database_path())
            .max_connections(self.storage.max_connections)
            .max_attempts(self.storage.max_attempts)
            .max_records(self.storage.max_records)
    }

    /// Credential store built from `[[devices]]`.
    pub fn credential_store(&self) -> InMemoryCredentialStore {
        InMemoryCredentialStore::new(self.devices.iter().cloned())
    }

    /// Ingest endpoint URL.
    pub fn ingest_url(&self) -> SyncResult<url::Url> {
        let base = url::Url::parse(&self.forwarder.cloud_url)?;
        let path = format!("{}/ingest", base.path().trim_end_matches('/'));
        let mut url = base;
        url.set_path(&path);
        Ok(url)
    }
}
