//! HTTP API endpoints

use crate::protocol::{
    CreateDatabaseRequest, FetchRequest, FetchResponse, TrackRequest, TrackResponse,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tallydb_core::storage::StorageEngine;
use tallydb_core::sync::SyncWaiter;
use tallydb_core::{BlockConfig, TallyError};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Application state
#[derive(Clone)]
pub struct AppState {
    engine: Arc<StorageEngine>,
    /// Set when track batches are acknowledged only after a sync pass
    durable: Option<SyncWaiter>,
}

impl AppState {
    pub fn new(engine: Arc<StorageEngine>, durable: Option<SyncWaiter>) -> Self {
        Self { engine, durable }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))
        // Batch endpoints
        .route("/track", post(track))
        .route("/fetch", post(fetch))
        // Database management
        .route("/databases", get(list_databases))
        .route("/databases/:name", post(create_database).delete(drop_database))
        .route("/sync", post(sync))
        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub database_count: usize,
    pub total_records: usize,
    pub total_mapped_bytes: u64,
    pub databases: Vec<DatabaseStats>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseStats {
    pub name: String,
    pub record_size: usize,
    pub records: usize,
    pub segments: usize,
    pub mapped_bytes: u64,
    pub dirty_segments: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: TallyError) -> ApiError {
    let status = match e {
        TallyError::Config(_) | TallyError::OutOfRange(_) | TallyError::InvalidFormat(_) => {
            StatusCode::BAD_REQUEST
        }
        TallyError::DatabaseNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    api_error(TallyError::Internal(e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: tallydb_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn track(
    State(state): State<AppState>,
    Json(batch): Json<Vec<TrackRequest>>,
) -> Result<Json<Vec<TrackResponse>>, ApiError> {
    let engine = state.engine.clone();
    let mut responses = tokio::task::spawn_blocking(move || {
        batch
            .iter()
            .map(|req| {
                match engine.track(&req.database, req.record, req.point, req.total, req.count) {
                    Ok(()) => TrackResponse::default(),
                    Err(e) => TrackResponse::failed(e),
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(join_error)?;

    let tracked = responses.iter().any(|r| r.error.is_none());
    if let (true, Some(waiter)) = (tracked, &state.durable) {
        if let Err(e) = waiter.wait_for_sync().await {
            warn!("Track batch not synced: {}", e);
            for response in responses.iter_mut().filter(|r| r.error.is_none()) {
                *response = TrackResponse::failed(format!("tracked but not synced: {}", e));
            }
        }
    }

    Ok(Json(responses))
}

async fn fetch(
    State(state): State<AppState>,
    Json(batch): Json<Vec<FetchRequest>>,
) -> Result<Json<Vec<FetchResponse>>, ApiError> {
    let handles: Vec<_> = batch
        .into_iter()
        .map(|req| {
            let engine = state.engine.clone();
            tokio::task::spawn_blocking(move || {
                match engine.fetch(&req.database, req.from, req.to) {
                    Ok(records) => FetchResponse::records(records),
                    Err(e) => FetchResponse::failed(e),
                }
            })
        })
        .collect();

    let mut responses = Vec::with_capacity(handles.len());
    for handle in handles {
        responses.push(handle.await.map_err(join_error)?);
    }

    Ok(Json(responses))
}

async fn list_databases(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.engine.list_databases())
}

async fn create_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CreateDatabaseRequest>,
) -> Result<StatusCode, ApiError> {
    let config = match req.segment_size {
        Some(segment_size) => BlockConfig { segment_size },
        None => state.engine.config().block_config(),
    };

    state
        .engine
        .create_database_with_config(&name, req.record_size, &config)
        .map_err(api_error)?;

    Ok(StatusCode::CREATED)
}

async fn drop_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.drop_database(&name).map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn sync(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || engine.sync_all())
        .await
        .map_err(join_error)?
        .map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.engine.stats();
    Json(StatsResponse {
        database_count: stats.database_count,
        total_records: stats.total_records,
        total_mapped_bytes: stats.total_mapped_bytes,
        databases: stats
            .databases
            .into_iter()
            .map(|d| DatabaseStats {
                name: d.name,
                record_size: d.record_size,
                records: d.records,
                segments: d.segments,
                mapped_bytes: d.mapped_bytes,
                dirty_segments: d.dirty_segments,
            })
            .collect(),
    })
}

async fn metrics(State(state): State<AppState>) -> String {
    let stats = state.engine.stats();

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP tallydb_databases_total Total number of databases\n");
    output.push_str("# TYPE tallydb_databases_total gauge\n");
    output.push_str(&format!("tallydb_databases_total {}\n", stats.database_count));

    output.push_str("# HELP tallydb_records_total Total number of addressable records\n");
    output.push_str("# TYPE tallydb_records_total gauge\n");
    output.push_str(&format!("tallydb_records_total {}\n", stats.total_records));

    output.push_str("# HELP tallydb_mapped_bytes_total Total mapped segment bytes\n");
    output.push_str("# TYPE tallydb_mapped_bytes_total gauge\n");
    output.push_str(&format!("tallydb_mapped_bytes_total {}\n", stats.total_mapped_bytes));

    output.push_str("# HELP tallydb_database_records Addressable records per database\n");
    output.push_str("# TYPE tallydb_database_records gauge\n");
    for db in &stats.databases {
        output.push_str(&format!(
            "tallydb_database_records{{database=\"{}\"}} {}\n",
            db.name, db.records
        ));
    }

    output.push_str("# HELP tallydb_dirty_segments Segments written since the last sync\n");
    output.push_str("# TYPE tallydb_dirty_segments gauge\n");
    for db in &stats.databases {
        output.push_str(&format!(
            "tallydb_dirty_segments{{database=\"{}\"}} {}\n",
            db.name, db.dirty_segments
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tallydb_core::storage::StorageConfig;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_engine(temp_dir: &TempDir) -> Arc<StorageEngine> {
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            segment_size: 4096,
            ..Default::default()
        };
        Arc::new(StorageEngine::new(config).unwrap())
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_router(AppState::new(test_engine(&temp_dir), None));

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");

        let (status, body) = send(&app, "GET", "/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn test_track_and_fetch() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_router(AppState::new(test_engine(&temp_dir), None));

        let (status, _) = send(
            &app,
            "POST",
            "/databases/latency",
            Some(serde_json::json!({"record_size": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            "POST",
            "/track",
            Some(serde_json::json!([
                {"database": "latency", "record": 2, "point": 1, "total": 1.5, "count": 1},
                {"database": "latency", "record": 2, "point": 1, "total": 2.0, "count": 3},
                {"database": "missing", "record": 0, "point": 0, "total": 1.0, "count": 1},
                {"database": "latency", "record": 0, "point": 4, "total": 1.0, "count": 1}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = json(&body);
        assert!(results[0].get("error").is_none());
        assert!(results[1].get("error").is_none());
        assert!(results[2]["error"].as_str().unwrap().contains("not found"));
        assert!(results[3]["error"].as_str().unwrap().contains("Out of range"));

        let (status, body) = send(
            &app,
            "POST",
            "/fetch",
            Some(serde_json::json!([
                {"database": "latency", "from": 2, "to": 3},
                {"database": "latency", "from": 3, "to": 1},
                {"database": "missing", "from": 0, "to": 1}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = json(&body);
        assert_eq!(
            results[0]["records"][0][1],
            serde_json::json!({"total": 3.5, "count": 4})
        );
        assert_eq!(results[0]["records"][0][0]["count"], 0);
        assert!(results[1]["error"].is_string());
        assert!(results[2]["error"].is_string());
        assert_eq!(results[2]["records"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_database_management() {
        let temp_dir = TempDir::new().unwrap();
        let engine = test_engine(&temp_dir);
        let app = create_router(AppState::new(engine.clone(), None));

        for name in ["b", "a"] {
            let (status, _) = send(
                &app,
                "POST",
                &format!("/databases/{}", name),
                Some(serde_json::json!({"record_size": 10, "segment_size": 1000})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        assert_eq!(engine.database("a").unwrap().meta().segment_size, 960);

        let (status, _) = send(
            &app,
            "POST",
            "/databases/a",
            Some(serde_json::json!({"record_size": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(&app, "GET", "/databases", None).await;
        assert_eq!(json(&body), serde_json::json!(["a", "b"]));

        let (status, _) = send(&app, "DELETE", "/databases/a", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/databases/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&app, "GET", "/databases", None).await;
        assert_eq!(json(&body), serde_json::json!(["b"]));
    }

    #[tokio::test]
    async fn test_sync_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let engine = test_engine(&temp_dir);
        let app = create_router(AppState::new(engine.clone(), None));

        engine.create_database("cpu", 4).unwrap();
        engine.track("cpu", 100, 0, 1.0, 1).unwrap();

        let (_, body) = send(&app, "GET", "/stats", None).await;
        let stats = json(&body);
        assert_eq!(stats["database_count"], 1);
        assert_eq!(stats["total_records"], 128);
        assert_eq!(stats["databases"][0]["dirty_segments"], 1);

        let (status, _) = send(&app, "POST", "/sync", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(engine.database("cpu").unwrap().block().dirty_segments(), 0);

        let (status, body) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("tallydb_databases_total 1"));
        assert!(text.contains("tallydb_dirty_segments{database=\"cpu\"} 0"));
    }

    #[tokio::test]
    async fn test_durable_track_waits_for_sync() {
        let temp_dir = TempDir::new().unwrap();
        let engine = test_engine(&temp_dir);
        engine.create_database("cpu", 4).unwrap();

        let syncer = tallydb_core::sync::spawn(engine.clone(), Duration::from_millis(10));
        let app = create_router(AppState::new(engine.clone(), Some(syncer.waiter())));

        let (status, body) = send(
            &app,
            "POST",
            "/track",
            Some(serde_json::json!([
                {"database": "cpu", "record": 5, "point": 2, "total": 7.0, "count": 1}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json(&body)[0].get("error").is_none());
        assert_eq!(engine.database("cpu").unwrap().block().dirty_segments(), 0);

        syncer.shutdown().await;
    }

    struct FailingDisk;

    impl tallydb_core::sync::Durable for FailingDisk {
        fn sync(&self) -> tallydb_core::Result<()> {
            Err(TallyError::Storage("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_durable_track_reports_failed_sync() {
        let temp_dir = TempDir::new().unwrap();
        let engine = test_engine(&temp_dir);
        engine.create_database("cpu", 4).unwrap();

        let syncer = tallydb_core::sync::spawn(Arc::new(FailingDisk), Duration::from_millis(10));
        let app = create_router(AppState::new(engine.clone(), Some(syncer.waiter())));

        let (status, body) = send(
            &app,
            "POST",
            "/track",
            Some(serde_json::json!([
                {"database": "cpu", "record": 1, "point": 0, "total": 2.0, "count": 1},
                {"database": "cpu", "record": 1, "point": 9, "total": 2.0, "count": 1}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let results = json(&body);
        let synced = results[0]["error"].as_str().unwrap();
        assert!(synced.starts_with("tracked but not synced"));
        assert!(synced.contains("disk full"));
        assert!(results[1]["error"].as_str().unwrap().contains("Out of range"));

        // The sample itself was applied
        assert_eq!(engine.fetch("cpu", 1, 2).unwrap()[0][0].count, 1);

        syncer.shutdown().await;
    }

    #[tokio::test]
    async fn test_metric_families_contiguous() {
        let temp_dir = TempDir::new().unwrap();
        let engine = test_engine(&temp_dir);
        engine.create_database("a", 4).unwrap();
        engine.create_database("b", 4).unwrap();
        let app = create_router(AppState::new(engine, None));

        let (_, body) = send(&app, "GET", "/metrics", None).await;
        let text = String::from_utf8(body).unwrap();

        let mut families: Vec<&str> = Vec::new();
        for line in text.lines() {
            let name = match line.strip_prefix("# TYPE ") {
                Some(rest) => rest.split(' ').next().unwrap(),
                None if line.starts_with('#') => continue,
                None => line.split(['{', ' ']).next().unwrap(),
            };
            if families.last() != Some(&name) {
                assert!(!families.contains(&name), "{} is split", name);
                families.push(name);
            }
        }

        for family in ["tallydb_database_records", "tallydb_dirty_segments"] {
            assert!(text.contains(&format!("# HELP {} ", family)));
            assert!(text.contains(&format!("# TYPE {} gauge", family)));
        }
    }
}
