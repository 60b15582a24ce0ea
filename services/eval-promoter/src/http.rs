//! HTTP front of the promoter: `POST /evaluate` plus the shared health routes.

use axum::{extract::State, http::StatusCode, response::{IntoResponse, Response}, routing::post, Json, Router};
use forecast_core::{ConfigHash, ForecastError, ModelArtifact, PromotionRecord, ScoreWeights};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::PromotionEngine;

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub config_hash: ConfigHash,
    #[serde(default)]
    pub identifier: String,
    pub candidates: Vec<ModelArtifact>,
    pub weights: Option<ScoreWeights>,
}

#[derive(Clone)]
pub struct AppState { pub engine: Arc<PromotionEngine>, pub default_weights: ScoreWeights }

pub struct ApiError(pub ForecastError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ForecastError::InsufficientCandidates { .. } | ForecastError::InvalidCandidates(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ForecastError::Config(_) | ForecastError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.0.to_string(), "retryable": self.0.is_retryable()}))).into_response()
    }
}

async fn evaluate(State(state): State<AppState>, Json(req): Json<EvaluateRequest>) -> Result<Json<PromotionRecord>, ApiError> {
    let weights = req.weights.unwrap_or(state.default_weights);
    let record = state.engine.evaluate(&req.config_hash, &req.identifier, &req.candidates, &weights).await.map_err(ApiError)?;
    Ok(Json(record))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/evaluate", post(evaluate))
        .with_state(state)
        .merge(forecast_core::health_router())
        .layer(TraceLayer::new_for_http())
}
