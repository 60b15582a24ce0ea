//! Core shared utilities for the forecasting pipeline services.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Json, Router};
use once_cell::sync::OnceCell;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub const JSON_LOG_ENV: &str = "FORECAST_JSON_LOG";

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus { Healthy, Degraded, Unhealthy }

impl HealthStatus {
    pub fn status_code(&self) -> StatusCode {
        match self { HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK, HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE }
    }
}

/// Install the global subscriber: env filter, plain or JSON fmt output, and an
/// OTLP span exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var(JSON_LOG_ENV).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
            tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false).boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(true).with_line_number(true).boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            Ok(endpoint) if !endpoint.trim().is_empty() => {
                let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().with_endpoint(endpoint).build()?;
                let provider = SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .with_resource(Resource::builder().with_service_name(service.to_string()).build())
                    .build();
                let tracer = provider.tracer(service.to_string());
                opentelemetry::global::set_tracer_provider(provider.clone());
                let _ = TRACER_PROVIDER.set(provider);
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            _ => None,
        };
        tracing_subscriber::registry().with(fmt_layer).with(env_filter).with(otel_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "forecast_core", service, "tracing initialized");
    Ok(())
}

pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() { tracing::warn!(error = %e, "tracer shutdown failed"); }
    }
}

/// Touch the shared metric groups so they show up on the first scrape.
pub fn init_metrics() -> Result<()> {
    once_cell::sync::Lazy::force(&EXTENDED_METRICS);
    Ok(())
}

/// Prometheus text exposition of the default registry.
pub fn metrics_response() -> axum::response::Response {
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

async fn metrics_handler() -> axum::response::Response { metrics_response() }

async fn ready_handler() -> impl IntoResponse {
    let ready = is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({"status": if ready { "ready" } else { "not_ready" }, "ready": ready})))
}

/// `/healthz`, `/ready` and `/metrics` for services without a richer surface.
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { Json(serde_json::json!({"status": HealthStatus::Healthy})) }))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
}

pub async fn serve(port: u16, app: Router) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await { tracing::error!(error = ?e, "health server failed"); }
    });
    Ok(())
}

pub mod artifacts;
pub mod autoscaling;
pub mod config;
pub mod error;
pub mod model_registry;
pub mod runner;
pub mod store;
pub mod window;
mod metrics_ext;

pub use artifacts::{scope_name, ArtifactPointer, ClaimCheck, ConfigHash, DatasetArtifact, Metrics, ModelArtifact, PointerScope, PromotionRecord, ScoreWeights};
pub use autoscaling::{AutoscaleController, MetricsSample, ObservedMetrics, ScalingAction, ScalingDecision, ScalingPolicy, ScalingReason, ScalingState, ServingStats};
pub use config::{load_pipeline_config, ExecutionMode, PipelineConfig};
pub use error::{ForecastError, ModelError, RegistryError, StoreError};
pub use metrics_ext::{ExtendedMetrics, EXTENDED_METRICS};
pub use runner::Runner;
pub use model_registry::{ForecastInput, ForecastModel, LocalRegistry, ModelMetadata, ModelRegistry, ModelSpec, RunRecord};
pub use store::{open_store, ArtifactStore, FsStore, MemoryStore};
pub use window::{FeatureFrame, FeatureWindow, Series};
