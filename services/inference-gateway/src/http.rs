//! HTTP surface of the gateway: predict, readiness, stats, reload and metrics.

use axum::{extract::State, http::{header, StatusCode}, response::{IntoResponse, Response}, routing::{get, post}, Json, Router};
use forecast_core::{ForecastError, ServingStats};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::{InferenceEngine, PredictRequest, Prediction};
use crate::watcher::{PromotionWatcher, ReloadReport};

#[derive(Clone)]
pub struct AppState { pub engine: Arc<InferenceEngine>, pub watcher: Arc<PromotionWatcher> }

/// Overload and missing-model answers carry `Retry-After` and are never a 500.
pub struct ApiError(pub ForecastError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            ForecastError::RequestOverloaded { .. } => (StatusCode::TOO_MANY_REQUESTS, Some("1")),
            ForecastError::ModelUnavailable | ForecastError::Timeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, Some("5")),
            ForecastError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, None),
            e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, Some("5")),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let body = Json(serde_json::json!({"error": self.0.to_string(), "retryable": self.0.is_retryable()}));
        match retry_after {
            Some(secs) => (status, [(header::RETRY_AFTER, secs)], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

async fn predict(State(state): State<AppState>, Json(req): Json<PredictRequest>) -> Result<Json<Prediction>, ApiError> {
    state.engine.predict(req).await.map(Json).map_err(ApiError)
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.engine.is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({
        "status": if ready { "ready" } else { "not_ready" },
        "model_ready": ready,
        "model_state": state.engine.slot().state(),
        "queue_length": state.engine.gate().occupancy(),
    })))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.engine.health();
    (health.status_code(), Json(serde_json::json!({"status": health})))
}

async fn stats(State(state): State<AppState>) -> Json<ServingStats> { Json(state.engine.stats()) }

async fn reload(State(state): State<AppState>) -> Json<ReloadReport> { Json(state.watcher.poll_once().await) }

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/ready", get(ready))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/reload", post(reload))
        .route("/metrics", get(|| async { forecast_core::metrics_response() }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
