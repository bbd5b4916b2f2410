//! HTTP API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tierdb_core::bucket::AggregationInterval;
use tierdb_core::query::{RangeQuery, SeriesPoint};
use tierdb_core::{
    DistributionStats, MaintenanceReport, NewSample, Sample, TelemetryStore, TierError,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Application state
pub type AppState = TelemetryStore;

/// Create the API router
pub fn create_router(store: TelemetryStore) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Ingestion and range reads
        .route("/samples", post(append_sample).get(query_samples))
        .route("/stats/distribution", get(distribution))
        // Operator maintenance
        .route("/admin/compress", post(force_compress))
        .route("/admin/cleanup", post(force_cleanup))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SamplesParams {
    /// Comma-separated device ids; all devices when absent
    devices: Option<String>,
    datastream: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: Option<usize>,
    interval: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub count: usize,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: TierError) -> ApiError {
    let status = if e.is_validation() {
        StatusCode::BAD_REQUEST
    } else if matches!(e, TierError::Conflict(_)) {
        StatusCode::CONFLICT
    } else if e.is_retryable() || matches!(e, TierError::Query(_)) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status.is_server_error() {
        warn!("Request failed: {}", e);
    }
    (status, Json(ErrorResponse { error: e.to_string() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: tierdb_core::VERSION.to_string(),
    })
}

async fn append_sample(
    State(store): State<AppState>,
    Json(sample): Json<NewSample>,
) -> Result<(StatusCode, Json<Sample>), ApiError> {
    let stored = store.append_sample(sample).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn query_samples(
    State(store): State<AppState>,
    Query(params): Query<SamplesParams>,
) -> Result<Json<SamplesResponse>, ApiError> {
    let devices = params
        .devices
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let mut query = RangeQuery::new(devices, params.datastream, params.start, params.end);
    if let Some(limit) = params.limit {
        query = query.with_limit(limit);
    }
    if let Some(interval) = params.interval.as_deref() {
        let interval: AggregationInterval = interval.parse().map_err(api_error)?;
        query = query.with_interval(interval);
    }

    let points = store.query_range(&query).map_err(api_error)?;
    Ok(Json(SamplesResponse {
        count: points.len(),
        points,
    }))
}

async fn distribution(State(store): State<AppState>) -> Result<Json<DistributionStats>, ApiError> {
    store.distribution_stats().map(Json).map_err(api_error)
}

async fn force_compress(
    State(store): State<AppState>,
) -> Result<Json<MaintenanceReport>, ApiError> {
    run_maintenance(store, |s| s.force_compress()).await
}

async fn force_cleanup(
    State(store): State<AppState>,
) -> Result<Json<MaintenanceReport>, ApiError> {
    run_maintenance(store, |s| s.force_cleanup()).await
}

/// Maintenance can run many batches, keep it off the async workers
async fn run_maintenance<F>(store: TelemetryStore, op: F) -> Result<Json<MaintenanceReport>, ApiError>
where
    F: FnOnce(&TelemetryStore) -> tierdb_core::Result<MaintenanceReport> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| api_error(TierError::Internal(format!("maintenance task failed: {e}"))))?
        .map(Json)
        .map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tierdb_core::TierConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = TelemetryStore::open(&TierConfig::default()).unwrap();
        create_router(store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_sample(device: &str, value: f64) -> Request<Body> {
        let body = serde_json::json!({
            "device_id": device,
            "datastream_id": "temp",
            "value": value,
            "payload": {"fw": "1.2.0"},
        });
        Request::builder()
            .method("POST")
            .uri("/samples")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let app = app();
        let start = Utc::now() - chrono::Duration::minutes(1);

        for (device, value) in [("dev-1", 21.5), ("dev-2", 19.0), ("dev-1", 22.5)] {
            let response = app.clone().oneshot(post_sample(device, value)).await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let end = Utc::now() + chrono::Duration::minutes(1);
        let uri = format!(
            "/samples?devices=dev-1&datastream=temp&start={}&end={}",
            start.format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ"),
        );
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["points"][0]["value"], 21.5);
        assert_eq!(body["points"][0]["source"], "raw");
        assert_eq!(body["points"][1]["payload"]["fw"], "1.2.0");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let app = app();

        let response = app.clone().oneshot(post_sample("", 1.0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = "/samples?datastream=temp&start=2024-03-01T10:00:00Z&end=2024-03-01T11:00:00Z&interval=7m";
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = "/samples?datastream=temp&start=2024-03-01T11:00:00Z&end=2024-03-01T10:00:00Z";
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_and_stats() {
        let app = app();
        let response = app.clone().oneshot(post_sample("dev-1", 1.0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/compress")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Fresh sample is still ahead of the compaction boundary
        assert_eq!(body_json(response).await["compressedRows"], 0);

        let response = app
            .oneshot(Request::builder().uri("/stats/distribution").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["original"]["total"], 1);
        assert_eq!(body["cleanupThreshold"], 10_000);
    }
}
