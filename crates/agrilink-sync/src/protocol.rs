//! # Cloud Ingestion Protocol
//!
//! Wire types exchanged with cloud ingestion and returned by the gateway.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Cloud Ingestion Contract                           │
//! │                                                                         │
//! │  EDGE ───► POST {cloud_url}/ingest                                     │
//! │            x-request-id: {batchId}   x-trace-id: {batchId}             │
//! │            x-tenant-id: {tenant}     (single-tenant batches only)      │
//! │            [ { id, tenantId, deviceId, sequence, topic,                │
//! │                payload (base64), capturedAt, correlationId }, ... ]     │
//! │                                                                         │
//! │  CLOUD ◄── 2xx  [ { id, status: accepted|rejected }, ... ]             │
//! │            2xx  { "results": [ { id, status }, ... ] }                 │
//! │            2xx  (empty body)       → everything accepted               │
//! │            any  { "error": { code, message, traceId } }  → failure     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agrilink_core::OutboxRecord;

// =============================================================================
// Request
// =============================================================================

/// One record as sent to cloud ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    pub id: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub sequence: i64,
    pub topic: String,
    /// Base64 (standard alphabet) of the opaque payload bytes.
    pub payload: String,
    pub captured_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl From<&OutboxRecord> for IngestRecord {
    fn from(record: &OutboxRecord) -> Self {
        IngestRecord {
            id: record.id,
            tenant_id: record.tenant_id.clone(),
            device_id: record.device_id.clone(),
            sequence: record.sequence,
            topic: record.topic.clone(),
            payload: BASE64.encode(&record.payload),
            captured_at: record.captured_at,
            correlation_id: record.correlation_id.clone(),
        }
    }
}

/// A delivery batch: the leased records of one forwarding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestBatch {
    /// Sent as `x-request-id` and `x-trace-id`.
    pub batch_id: Uuid,
    /// Records in ascending id order.
    pub records: Vec<IngestRecord>,
}

impl IngestBatch {
    pub fn from_records(records: &[OutboxRecord]) -> Self {
        IngestBatch {
            batch_id: Uuid::new_v4(),
            records: records.iter().map(IngestRecord::from).collect(),
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// The tenant, if every record belongs to the same one.
    pub fn single_tenant(&self) -> Option<&str> {
        let first = self.records.first()?.tenant_id.as_str();
        self.records
            .iter()
            .all(|r| r.tenant_id == first)
            .then_some(first)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Response
// =============================================================================

/// Per-record verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Accepted,
    Rejected,
}

/// Per-record result from cloud ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub id: i64,
    pub status: RecordStatus,
    #[serde(default, alias = "reason", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error shape shared by cloud ingestion and the local gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// `{ "error": { ... } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: Option<String>) -> Self {
        ErrorResponse {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                trace_id,
            },
        }
    }
}

/// Any body cloud ingestion may return.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IngestResponse {
    Results(Vec<RecordResult>),
    Wrapped { results: Vec<RecordResult> },
    Error(ErrorResponse),
}

// =============================================================================
// Delivery Report
// =============================================================================

/// What the cloud said about a batch it answered with 2xx.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub accepted: Vec<i64>,
    pub rejected: Vec<(i64, Option<String>)>,
}

impl DeliveryReport {
    /// Every record of the batch accepted (empty 2xx body).
    pub fn all_accepted(batch: &IngestBatch) -> Self {
        DeliveryReport {
            accepted: batch.ids(),
            rejected: Vec::new(),
        }
    }

    pub fn from_results(results: Vec<RecordResult>) -> Self {
        let mut report = DeliveryReport::default();
        for result in results {
            match result.status {
                RecordStatus::Accepted => report.accepted.push(result.id),
                RecordStatus::Rejected => report.rejected.push((result.id, result.message)),
            }
        }
        report
    }
}
