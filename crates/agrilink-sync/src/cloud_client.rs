//! # Cloud Ingestion Client
//!
//! Sends delivery batches to cloud ingestion over HTTPS.
//!
//! The forwarder only sees the [`IngestClient`] trait; tests substitute
//! scripted clients, production uses [`HttpIngestClient`].

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use agrilink_core::correlation::{REQUEST_ID_HEADER, TENANT_ID_HEADER, TRACE_ID_HEADER};

use crate::config::EdgeConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{DeliveryReport, ErrorResponse, IngestBatch, IngestResponse};

/// Delivers a batch to cloud ingestion.
///
/// `Ok` means the cloud answered 2xx with per-record results (or an empty
/// body). Anything else is a full-batch failure.
#[async_trait]
pub trait IngestClient: Send + Sync {
    async fn send(&self, batch: &IngestBatch) -> SyncResult<DeliveryReport>;
}

/// reqwest-backed client for `POST {cloud_url}/ingest`.
#[derive(Debug, Clone)]
pub struct HttpIngestClient {
    client: Client,
    url: Url,
    auth_token: Option<String>,
}

impl HttpIngestClient {
    pub fn new(url: Url, auth_token: Option<String>) -> SyncResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("agrilink-edge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpIngestClient {
            client,
            url,
            auth_token,
        })
    }

    pub fn from_config(config: &EdgeConfig) -> SyncResult<Self> {
        Self::new(config.ingest_url()?, config.forwarder.auth_token.clone())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn send(&self, batch: &IngestBatch) -> SyncResult<DeliveryReport> {
        let batch_id = batch.batch_id.to_string();

        let mut request = self
            .client
            .post(self.url.clone())
            .header(REQUEST_ID_HEADER, &batch_id)
            .header(TRACE_ID_HEADER, &batch_id)
            .json(&batch.records);

        if let Some(tenant_id) = batch.single_tenant() {
            request = request.header(TENANT_ID_HEADER, tenant_id);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        debug!(
            url = %self.url,
            batch_id = %batch_id,
            records = batch.len(),
            "Sending batch to cloud ingestion"
        );

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let detail = match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(err) => format!("{}: {}", err.error.code, err.error.message),
                Err(_) => String::from_utf8_lossy(&body).trim().to_string(),
            };
            return Err(SyncError::DeliveryFailure(format!("HTTP {}: {}", status, detail)));
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(DeliveryReport::all_accepted(batch));
        }

        match serde_json::from_slice::<IngestResponse>(&body) {
            Ok(IngestResponse::Results(results)) | Ok(IngestResponse::Wrapped { results }) => {
                Ok(DeliveryReport::from_results(results))
            }
            Ok(IngestResponse::Error(err)) => {
                warn!(
                    batch_id = %batch_id,
                    code = %err.error.code,
                    trace_id = ?err.error.trace_id,
                    "Cloud ingestion returned a batch-level error"
                );
                Err(SyncError::DeliveryFailure(format!(
                    "{}: {}",
                    err.error.code, err.error.message
                )))
            }
            Err(e) => Err(SyncError::InvalidResponse(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;

    use agrilink_core::{OutboxRecord, SyncStatus};

    #[derive(Clone)]
    struct Scripted {
        status: StatusCode,
        body: &'static str,
        seen: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
    }

    async fn ingest(State(state): State<Scripted>, headers: HeaderMap, body: Bytes) -> (StatusCode, &'static str) {
        state.seen.lock().unwrap().push((headers, body));
        (state.status, state.body)
    }

    async fn serve(status: StatusCode, body: &'static str) -> (Url, Arc<Mutex<Vec<(HeaderMap, Bytes)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().route("/ingest", post(ingest)).with_state(Scripted {
            status,
            body,
            seen: seen.clone(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{}/ingest", addr)).unwrap(), seen)
    }

    fn batch(tenants: &[&str]) -> IngestBatch {
        let records: Vec<OutboxRecord> = tenants
            .iter()
            .enumerate()
            .map(|(i, tenant)| OutboxRecord {
                id: i as i64 + 1,
                sequence: i as i64 + 1,
                tenant_id: tenant.to_string(),
                device_id: "dev-7".to_string(),
                topic: format!("iot/telemetry/{}/f1/b1/dev-7/temperature", tenant),
                payload: b"21.5".to_vec(),
                captured_at: Utc::now(),
                sync_status: SyncStatus::InFlight,
                attempt_count: 0,
                last_attempt_at: None,
                last_error: None,
                correlation_id: format!("req-{}", i),
                acked_at: None,
                dead_lettered_at: None,
            })
            .collect();
        IngestBatch::from_records(&records)
    }

    #[tokio::test]
    async fn test_per_record_results_and_headers() {
        let (url, seen) = serve(
            StatusCode::OK,
            r#"[{"id":1,"status":"accepted"},{"id":2,"status":"rejected"}]"#,
        )
        .await;
        let client = HttpIngestClient::new(url, Some("secret".into())).unwrap();

        let batch = batch(&["t1", "t1"]);
        let report = client.send(&batch).await.unwrap();
        assert_eq!(report.accepted, vec![1]);
        assert_eq!(report.rejected, vec![(2, None)]);

        let seen = seen.lock().unwrap();
        let (headers, body) = &seen[0];
        let batch_id = batch.batch_id.to_string();
        assert_eq!(headers["x-request-id"], batch_id.as_str());
        assert_eq!(headers["x-trace-id"], batch_id.as_str());
        assert_eq!(headers["x-tenant-id"], "t1");
        assert_eq!(headers["authorization"], "Bearer secret");

        let sent: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent.as_array().unwrap().len(), 2);
        assert_eq!(sent[0]["deviceId"], "dev-7");
    }

    #[tokio::test]
    async fn test_mixed_tenant_batch_has_no_tenant_header() {
        let (url, seen) = serve(StatusCode::OK, r#"{"results":[]}"#).await;
        let client = HttpIngestClient::new(url, None).unwrap();

        client.send(&batch(&["t1", "t2"])).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[0].0.get("x-tenant-id").is_none());
        assert!(seen[0].0.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_empty_success_body_accepts_everything() {
        let (url, _) = serve(StatusCode::ACCEPTED, "").await;
        let client = HttpIngestClient::new(url, None).unwrap();

        let report = client.send(&batch(&["t1", "t1", "t1"])).await.unwrap();
        assert_eq!(report.accepted, vec![1, 2, 3]);
        assert!(report.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_delivery_failure() {
        let (url, _) = serve(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":{"code":"OVERLOADED","message":"try later","traceId":"x"}}"#,
        )
        .await;
        let client = HttpIngestClient::new(url, None).unwrap();

        let err = client.send(&batch(&["t1"])).await.unwrap_err();
        assert!(matches!(err, SyncError::DeliveryFailure(ref m) if m.contains("OVERLOADED")));
    }

    #[tokio::test]
    async fn test_error_shape_with_2xx_is_delivery_failure() {
        let (url, _) = serve(
            StatusCode::OK,
            r#"{"error":{"code":"BAD_BATCH","message":"nope"}}"#,
        )
        .await;
        let client = HttpIngestClient::new(url, None).unwrap();

        assert!(matches!(
            client.send(&batch(&["t1"])).await,
            Err(SyncError::DeliveryFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_invalid_response() {
        let (url, _) = serve(StatusCode::OK, "<html>gateway</html>").await;
        let client = HttpIngestClient::new(url, None).unwrap();

        let err = client.send(&batch(&["t1"])).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidResponse(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_cloud() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{}/ingest", addr)).unwrap();
        let client = HttpIngestClient::new(url, None).unwrap();

        assert!(matches!(
            client.send(&batch(&["t1"])).await,
            Err(SyncError::DeliveryFailure(_))
        ));
    }
}
