//! Read-only management HTTP surface
//!
//! - `GET /v1/status`: snapshot flag, cached key count, connection state
//! - `GET /v1/values/{key}`: latest cached value for one key
//! - `GET /v1/metrics`: pipeline counters
//! - `GET /v1/export.csv`: CSV of every cached value

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use feed_types::record::LiveRecord;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::connector::{ConnectionState, ConnectorStatus};
use crate::export;
use crate::lifecycle::PipelineLifecycle;
use crate::metrics::PipelineMetrics;
use crate::store::LiveValueStore;

/// What the status endpoint reports about the running pipeline.
pub trait PipelineStatus: Send + Sync {
    fn is_running(&self) -> bool;

    fn connection_state(&self) -> Option<ConnectionState>;
}

impl<T: Send + 'static> PipelineStatus for PipelineLifecycle<T> {
    fn is_running(&self) -> bool {
        PipelineLifecycle::is_running(self)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        PipelineLifecycle::connection_state(self)
    }
}

impl PipelineStatus for ConnectorStatus {
    fn is_running(&self) -> bool {
        !self.is_terminated()
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        Some(self.state())
    }
}

/// Errors returned by management endpoints.
#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ManagementError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ManagementError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            ManagementError::Internal(err) => {
                tracing::error!(error = %err, "Management request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

/// Shared state of the management router.
pub struct ManagementState<T> {
    pub store: Arc<LiveValueStore<T>>,
    pub metrics: Arc<PipelineMetrics>,
    pub pipeline: Arc<dyn PipelineStatus>,
}

impl<T> Clone for ManagementState<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub snapshot_complete: bool,
    pub cached_keys: usize,
    pub connection_state: Option<ConnectionState>,
    pub running: bool,
}

pub fn create_router<T>(state: ManagementState<T>) -> Router
where
    T: LiveRecord + Serialize,
{
    let api_routes = Router::new()
        .route("/status", get(status::<T>))
        .route("/values/{key}", get(value::<T>))
        .route("/metrics", get(metrics::<T>))
        .route("/export.csv", get(export_csv::<T>));

    Router::new()
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status<T>(State(state): State<ManagementState<T>>) -> Json<StatusResponse>
where
    T: LiveRecord,
{
    Json(StatusResponse {
        snapshot_complete: state.store.is_snapshot_complete(),
        cached_keys: state.store.len(),
        connection_state: state.pipeline.connection_state(),
        running: state.pipeline.is_running(),
    })
}

async fn value<T>(
    State(state): State<ManagementState<T>>,
    Path(key): Path<String>,
) -> Result<Json<T>, ManagementError>
where
    T: LiveRecord + Serialize,
{
    state
        .store
        .get_latest_value(&key)
        .map(Json)
        .ok_or_else(|| ManagementError::NotFound(format!("no value cached for {}", key)))
}

async fn metrics<T>(State(state): State<ManagementState<T>>) -> Json<BTreeMap<String, u64>>
where
    T: LiveRecord,
{
    Json(state.metrics.export())
}

async fn export_csv<T>(State(state): State<ManagementState<T>>) -> Result<Response, ManagementError>
where
    T: LiveRecord,
{
    let mut body = Vec::new();
    export::write_csv(&state.store, &mut body).map_err(anyhow::Error::from)?;
    Ok((
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use feed_types::record::MarketDataRecord;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    struct FixedStatus;

    impl PipelineStatus for FixedStatus {
        fn is_running(&self) -> bool {
            true
        }

        fn connection_state(&self) -> Option<ConnectionState> {
            Some(ConnectionState::Reading)
        }
    }

    fn app() -> (Router, Arc<LiveValueStore<MarketDataRecord>>) {
        let store = Arc::new(LiveValueStore::new());
        store.store_value(
            "AAPL.O",
            MarketDataRecord::new("AAPL.O", 7, 0).with_field("LAST", Decimal::new(10125, 2)),
        );
        let metrics = Arc::new(PipelineMetrics::new());
        metrics.record_connect();

        let router = create_router(ManagementState {
            store: Arc::clone(&store),
            metrics,
            pipeline: Arc::new(FixedStatus),
        });
        (router, store)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (router, store) = app();
        store.set_snapshot_complete(true);

        let (status, body) = get_body(router, "/v1/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["snapshot_complete"], true);
        assert_eq!(json["cached_keys"], 1);
        assert_eq!(json["connection_state"], "reading");
        assert_eq!(json["running"], true);
    }

    #[tokio::test]
    async fn test_value_lookup() {
        let (router, _store) = app();

        let (status, body) = get_body(router.clone(), "/v1/values/AAPL.O").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["fields"]["LAST"], "101.25");

        let (status, body) = get_body(router, "/v1/values/NOPE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_metrics_and_export() {
        let (router, _store) = app();

        let (status, body) = get_body(router.clone(), "/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["connects"], 1);

        let (status, body) = get_body(router, "/v1/export.csv").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), "key,LAST\nAAPL.O,101.25\n");
    }
}
