use std::{future::Future, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::{Query, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, health::HealthChecker, queue::DurableQueue},
    error::{ProducerError, QueueError},
    models::{circuit_breaker::CircuitSnapshot, health::HealthStatus},
    services::{producer::Producer, reconciliation::{Reconciler, SYNC_IN_PROGRESS}, stats::StatsRegistry},
};

pub const API_KEY_HEADER: &str = "x-api-key";

const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

pub struct AppState {
    pub producer: Producer,
    pub queue: Arc<dyn DurableQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub stats: Arc<StatsRegistry>,
    pub health_checker: HealthChecker,
    /// Required in `X-API-Key` for every operator route.
    pub api_key: Option<String>,
    pub reconciler: Option<Arc<Reconciler>>,
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    depth: u64,
    dead_letter_depth: u64,
    circuit_breaker: CircuitSnapshot,
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_DEAD_LETTER_LIMIT
}

/// Unix seconds; either bound may be left out.
#[derive(Debug, Deserialize)]
struct SyncQuery {
    from: Option<i64>,
    to: Option<i64>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/queue", get(queue_status))
        .route("/queue/dead-letter", get(dead_letters))
        .route("/workers", get(worker_stats))
        .route("/reconciliation", get(reconciliation_status))
        .route("/reconciliation/sync", post(trigger_sync))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/webhook/shopee", post(receive_webhook))
        .route("/health", get(health_check))
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server<S>(
    state: Arc<AppState>,
    port: u16,
    shutdown: S,
) -> Result<(), std::io::Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "Webhook server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn queue_unavailable(e: QueueError) -> Response {
    warn!(error = %e, "Queue inspection failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn digest(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "operator API not configured (DASHBOARD_API_KEY unset)" })),
        )
            .into_response();
    };

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| digest(v.as_bytes()));

    if presented != Some(digest(expected.as_bytes())) {
        warn!(path = %request.uri().path(), "Rejected operator request with bad API key");
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("ApiKey"));
        return response;
    }

    next.run(request).await
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    match state.producer.handle(&body, signature).await {
        Ok(_) => StatusCode::OK,
        Err(ProducerError::Signature(_)) => StatusCode::UNAUTHORIZED,
        Err(ProducerError::MalformedPayload(_)) => StatusCode::BAD_REQUEST,
    }
}

async fn queue_status(State(state): State<Arc<AppState>>) -> Response {
    let (depth, dead_letter_depth) =
        tokio::join!(state.queue.depth(), state.queue.dead_letter_depth());

    match (depth, dead_letter_depth) {
        (Ok(depth), Ok(dead_letter_depth)) => Json(QueueStatus {
            depth,
            dead_letter_depth,
            circuit_breaker: state.breaker.snapshot(),
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => queue_unavailable(e),
    }
}

async fn dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Response {
    let limit = query.limit.min(MAX_DEAD_LETTER_LIMIT);

    match state.queue.dead_letters(limit).await {
        Ok(entries) => Json(json!({ "count": entries.len(), "entries": entries })).into_response(),
        Err(e) => queue_unavailable(e),
    }
}

async fn worker_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

fn reconciliation_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "reconciliation disabled" })),
    )
        .into_response()
}

fn from_unix(seconds: i64, name: &str) -> Result<DateTime<Utc>, Response> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("{} is out of range", name) })),
        )
            .into_response()
    })
}

async fn reconciliation_status(State(state): State<Arc<AppState>>) -> Response {
    match &state.reconciler {
        Some(reconciler) => Json(reconciler.status().await).into_response(),
        None => reconciliation_disabled(),
    }
}

async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let Some(reconciler) = &state.reconciler else {
        return reconciliation_disabled();
    };

    let result = match (query.from, query.to) {
        (None, None) => reconciler.scheduled_sync().await,
        (from, to) => {
            let now = Utc::now();
            let from = match from.map(|s| from_unix(s, "from")).transpose() {
                Ok(from) => from.unwrap_or(now - chrono::TimeDelta::days(1)),
                Err(response) => return response,
            };
            let to = match to.map(|s| from_unix(s, "to")).transpose() {
                Ok(to) => to.unwrap_or(now),
                Err(response) => return response,
            };
            if from >= to {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "from must be before to" })),
                )
                    .into_response();
            }
            reconciler.manual_sync(from, to).await
        }
    };

    info!(kind = ?result.kind, success = result.success, "Reconciliation triggered by operator");

    let status = if result.success {
        StatusCode::OK
    } else if result.errors.iter().any(|e| e == SYNC_IN_PROGRESS) {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result)).into_response()
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}
