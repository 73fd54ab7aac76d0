//! Background worker for large matching refreshes: accepts delegated batches,
//! processes them in throttled chunks and regenerates stale embeddings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gmr_scoring::{EmbeddingGenerator, HttpEmbeddingGenerator};
use gmr_storage::{PgStore, StoreSet};
use gmr_sync::auth::{constant_time_eq, non_empty_env};
use gmr_sync::{MatchingConfig, WorkerAck, WorkerBatchRequest, ACCEPTED_STATUS};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod batch;
pub mod embeddings;
pub mod health;

pub use batch::{BatchReport, BatchTracker, ChunkedBatchRunner, ResourceThrottle};
pub use embeddings::{EmbeddingBatchRunner, EmbeddingReport, DEFAULT_EMBEDDING_BATCH};
pub use health::{
    FixedMemoryProbe, HealthStatus, MemoryProbe, MemoryThresholds, ProcessMemoryProbe,
};

pub const CRATE_NAME: &str = "gmr-worker";

pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub secret: Option<String>,
    pub throttle: ResourceThrottle,
    pub thresholds: MemoryThresholds,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = MemoryThresholds::default();
        Self {
            port: env_parse("WORKER_PORT", 8081),
            secret: non_empty_env("WORKER_SECRET"),
            throttle: ResourceThrottle {
                chunk_size: env_parse("WORKER_CHUNK_SIZE", batch::DEFAULT_CHUNK_SIZE),
                pause: Duration::from_millis(env_parse(
                    "WORKER_CHUNK_PAUSE_MS",
                    batch::DEFAULT_CHUNK_PAUSE.as_millis() as u64,
                )),
            },
            thresholds: MemoryThresholds {
                warning_mb: env_parse("WORKER_MEMORY_WARNING_MB", defaults.warning_mb),
                critical_mb: env_parse("WORKER_MEMORY_CRITICAL_MB", defaults.critical_mb),
            },
        }
    }
}

pub struct AppState {
    pub secret: Option<String>,
    pub runner: Arc<ChunkedBatchRunner>,
    pub embedding_generator: Option<Arc<dyn EmbeddingGenerator>>,
    pub tracker: Arc<BatchTracker>,
    pub probe: Arc<dyn MemoryProbe>,
    pub thresholds: MemoryThresholds,
}

impl AppState {
    pub fn stores(&self) -> &StoreSet {
        self.runner.pipeline().stores()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate-embeddings", post(generate_embeddings_handler))
        .route("/matching/batch", post(matching_batch_handler))
        .route("/matching/stats", get(matching_stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    let config = WorkerConfig::from_env();
    let matching = MatchingConfig::from_env();
    let store = PgStore::connect(&matching.database_url, 10)
        .await
        .context("connecting worker store")?;
    let stores = StoreSet::shared(Arc::new(store));

    let embedding_generator = match &matching.embedding_url {
        Some(url) => Some(Arc::new(HttpEmbeddingGenerator::new(
            matching.http_client()?,
            url.clone(),
            matching.embedding_api_key.clone(),
            matching.embedding_model.clone(),
        )) as Arc<dyn EmbeddingGenerator>),
        None => None,
    };
    let pipeline = Arc::new(matching.pipeline(stores)?);
    let probe: Arc<dyn MemoryProbe> = Arc::new(ProcessMemoryProbe);
    if config.secret.is_none() {
        warn!("WORKER_SECRET is not set; every authenticated route will reject requests");
    }

    let state = AppState {
        secret: config.secret.clone(),
        runner: Arc::new(ChunkedBatchRunner::new(pipeline, probe.clone(), config.throttle)),
        embedding_generator,
        tracker: Arc::new(BatchTracker::new()),
        probe,
        thresholds: config.thresholds,
    };
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "worker listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: HealthStatus,
    memory_mb: Option<u64>,
    warning_mb: u64,
    critical_mb: u64,
    active_batches: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let memory_mb = state.probe.resident_mb();
    let status = state.thresholds.classify(memory_mb);
    let code = match status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let body = HealthBody {
        status,
        memory_mb,
        warning_mb: state.thresholds.warning_mb,
        critical_mb: state.thresholds.critical_mb,
        active_batches: state.tracker.active(),
    };
    (code, Json(body)).into_response()
}

async fn matching_batch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let request: WorkerBatchRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    if request.batch_size == 0 || request.batch_size > MAX_BATCH_SIZE {
        return bad_request(format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"));
    }
    if request.max_organizations == 0 {
        return bad_request("max_organizations must be at least 1".to_string());
    }

    let mut organization_ids = match state.stores().directory.eligible_organization_ids().await {
        Ok(ids) => ids,
        Err(err) => return server_error(err),
    };
    organization_ids.truncate(request.max_organizations);

    let batch_id = Uuid::new_v4();
    let runner = Arc::new(ChunkedBatchRunner::new(
        state.runner.pipeline().clone(),
        state.probe.clone(),
        ResourceThrottle {
            chunk_size: request.batch_size,
            pause: state.runner.throttle().pause,
        },
    ));
    info!(%batch_id, organizations = organization_ids.len(), batch_size = request.batch_size, "batch accepted");
    state.tracker.spawn_batch(runner, batch_id, organization_ids);

    (
        StatusCode::ACCEPTED,
        Json(WorkerAck {
            status: ACCEPTED_STATUS.to_string(),
            batch_id,
        }),
    )
        .into_response()
}

/// An empty body means the default batch size.
#[derive(Debug, Default, Deserialize)]
struct EmbeddingRequest {
    #[serde(default)]
    batch_size: Option<usize>,
}

async fn generate_embeddings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        EmbeddingRequest::default()
    } else {
        match parse_json::<EmbeddingRequest>(&body) {
            Ok(request) => request,
            Err(resp) => return resp,
        }
    };
    let batch_size = request.batch_size.unwrap_or(DEFAULT_EMBEDDING_BATCH);
    if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
        return bad_request(format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"));
    }
    let Some(generator) = state.embedding_generator.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "embedding service not configured" })),
        )
            .into_response();
    };

    let runner = EmbeddingBatchRunner::new(state.stores().clone(), generator).with_batch_size(batch_size);
    info!(batch_size, "embedding refresh accepted");
    state.tracker.spawn_embeddings(Arc::new(runner));
    (StatusCode::ACCEPTED, Json(json!({ "status": ACCEPTED_STATUS }))).into_response()
}

async fn matching_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let since = Utc::now() - chrono::Duration::hours(24);
    match state.stores().results.stats(since).await {
        Ok(results) => Json(json!({
            "results": results,
            "active_batches": state.tracker.active(),
            "last_batch": state.tracker.last_batch().await,
            "last_embedding_run": state.tracker.last_embedding_run().await,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.secret.as_deref() else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()))
}

/// Only called once the caller is authorized, so anonymous requests never see parse errors.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| bad_request(format!("invalid request body: {err}")))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "worker request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
