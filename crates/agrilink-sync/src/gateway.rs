//! # Publish Gateway
//!
//! Local HTTP entry point used by the broker bridge to hand device publishes
//! to ingestion.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Publish Gateway (Axum)                           │
//! │                                                                         │
//! │  POST /publish/{*topic}                                                │
//! │       x-device-username: dev-7                                         │
//! │       x-request-id: ...          (optional, becomes correlationId)     │
//! │       <raw payload bytes>                                              │
//! │                                                                         │
//! │       202 { id, sequence, correlationId }                              │
//! │       400 MALFORMED_TOPIC / EMPTY_PAYLOAD                              │
//! │       403 UNAUTHORIZED                                                 │
//! │       413 PAYLOAD_TOO_LARGE                                            │
//! │       503 STORAGE_UNAVAILABLE                                          │
//! │       507 STORAGE_FULL                                                 │
//! │                                                                         │
//! │  GET /health         liveness + database reachability                  │
//! │  GET /outbox/stats   record counts per status                          │
//! │  GET /outbox/dead-letters?limit=N                                      │
//! │  POST /outbox/dead-letters/{id}/requeue                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use agrilink_core::correlation::REQUEST_ID_HEADER;
use agrilink_core::{CorrelationContext, OutboxRecord};
use agrilink_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::ingest::IngestionService;
use crate::protocol::ErrorResponse;

/// Header carrying the broker-authenticated device username.
pub const DEVICE_USERNAME_HEADER: &str = "x-device-username";

// =============================================================================
// Responses
// =============================================================================

/// Body of a `202 Accepted` publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAccepted {
    pub id: i64,
    pub sequence: i64,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub database: bool,
}

/// Operator view of a dead-lettered record (payload omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView {
    pub id: i64,
    pub sequence: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub topic: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl From<OutboxRecord> for DeadLetterView {
    fn from(record: OutboxRecord) -> Self {
        DeadLetterView {
            id: record.id,
            sequence: record.sequence,
            tenant_id: record.tenant_id,
            device_id: record.device_id,
            topic: record.topic,
            attempt_count: record.attempt_count,
            last_error: record.last_error,
            correlation_id: record.correlation_id,
            dead_lettered_at: record.dead_lettered_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_list_limit")]
    limit: u32,
}

fn default_list_limit() -> u32 {
    100
}

/// A [`SyncError`] rendered in the shared error shape.
struct ApiError {
    error: SyncError,
    trace_id: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.error {
            SyncError::MalformedTopic { .. } | SyncError::EmptyPayload => StatusCode::BAD_REQUEST,
            SyncError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            SyncError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SyncError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.error.code(), error = %self.error, "Gateway request failed");
        }
        let body = ErrorResponse::new(self.error.code(), self.error.to_string(), self.trace_id);
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Gateway
// =============================================================================

struct GatewayState {
    ingest: IngestionService,
    db: Database,
}

/// HTTP server wrapping [`IngestionService`].
pub struct Gateway {
    bind_address: String,
    state: Arc<GatewayState>,
}

/// Handle for a running gateway.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!(?e, "Gateway task failed");
        }
    }
}

impl Gateway {
    pub fn new(bind_address: impl Into<String>, ingest: IngestionService, db: Database) -> Self {
        Gateway {
            bind_address: bind_address.into(),
            state: Arc::new(GatewayState { ingest, db }),
        }
    }

    fn router(&self) -> Router {
        // Bodies past the limit are mapped to PAYLOAD_TOO_LARGE by the handler.
        let body_limit = self.state.ingest.max_payload_bytes().saturating_add(1);

        Router::new()
            .route("/publish/{*topic}", post(publish_handler))
            .route("/health", get(health_handler))
            .route("/outbox/stats", get(stats_handler))
            .route("/outbox/dead-letters", get(dead_letters_handler))
            .route("/outbox/dead-letters/{id}/requeue", post(requeue_handler))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(self.state.clone())
    }

    /// Binds the listener and spawns the server.
    pub async fn start(self) -> SyncResult<GatewayHandle> {
        let app = self.router();

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::InvalidConfig(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Internal(format!("Listener address: {}", e)))?;

        info!(addr = %local_addr, "Publish gateway started");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    info!("Publish gateway shutting down");
                })
                .await;
            if let Err(e) = served {
                error!(?e, "Publish gateway stopped with error");
            }
        });

        Ok(GatewayHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn publish_handler(
    State(state): State<Arc<GatewayState>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let correlation = CorrelationContext::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let body = body.map_err(|rejection| ApiError {
        error: body_rejection(&state, &headers, rejection),
        trace_id: correlation.request_id.clone(),
    })?;
    let username = headers
        .get(DEVICE_USERNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    debug!(username = %username, topic = %topic, bytes = body.len(), "Publish received");

    let record = state
        .ingest
        .ingest_as(username, &topic, &body, Utc::now(), &correlation)
        .await
        .map_err(|error| ApiError {
            error,
            trace_id: correlation.request_id.clone(),
        })?;

    let accepted = PublishAccepted {
        id: record.id,
        sequence: record.sequence,
        correlation_id: record.correlation_id.clone(),
    };

    Ok((
        StatusCode::ACCEPTED,
        [(REQUEST_ID_HEADER, record.correlation_id)],
        Json(accepted),
    ))
}

/// Maps a body the extractor refused onto the gateway's error shape.
fn body_rejection(state: &GatewayState, headers: &HeaderMap, rejection: BytesRejection) -> SyncError {
    let max = state.ingest.max_payload_bytes();
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(|| max.saturating_add(1));
        SyncError::PayloadTooLarge { size, max }
    } else {
        SyncError::Internal(format!("Failed to read request body: {}", rejection.body_text()))
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let database = state.db.health_check().await;
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthStatus {
        status: if database { "ok" } else { "degraded" }.to_string(),
        database,
    };
    (status, Json(body))
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .db
        .outbox()
        .count_by_status()
        .await
        .map_err(|e| ApiError {
            error: e.into(),
            trace_id: None,
        })?;
    Ok(Json(stats))
}

async fn dead_letters_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .db
        .outbox()
        .list_dead_letters(params.limit)
        .await
        .map_err(|e| ApiError {
            error: e.into(),
            trace_id: None,
        })?;
    let views: Vec<DeadLetterView> = records.into_iter().map(DeadLetterView::from).collect();
    Ok(Json(views))
}

async fn requeue_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .db
        .outbox()
        .requeue_dead_letter(id)
        .await
        .map_err(|e| ApiError {
            error: e.into(),
            trace_id: None,
        })?;

    info!(id, "Dead letter requeued by operator");
    state.ingest.new_records().notify_one();
    Ok(StatusCode::NO_CONTENT)
}
