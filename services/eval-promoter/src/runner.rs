//! The two ways the promoter runs, chosen once at startup from
//! `PipelineConfig::mode`.

use anyhow::Result;
use async_trait::async_trait;
use forecast_core::store::get_json;
use forecast_core::{ArtifactPointer, ArtifactStore, ClaimCheck, ConfigHash, ExecutionMode, ForecastError, ModelArtifact, PipelineConfig, PromotionRecord, Runner, ScoreWeights, StoreError};
use forecast_core::artifacts::CURRENT_POINTER;
use forecast_resilience::{retry_if, RetryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::engine::PromotionEngine;
use crate::http::{router, AppState};

/// One evaluation over candidate claim-checks, then exit.
pub struct BatchRunner {
    pub engine: Arc<PromotionEngine>,
    pub store: Arc<dyn ArtifactStore>,
    pub config_hash: ConfigHash,
    pub identifier: String,
    pub candidates: Vec<ArtifactPointer>,
    pub weights: ScoreWeights,
    pub output_path: Option<PathBuf>,
    pub retry: RetryConfig,
    pub read_timeout: Duration,
}

impl BatchRunner {
    pub async fn load_candidates(&self) -> Result<Vec<ModelArtifact>, ForecastError> {
        let mut out = Vec::with_capacity(self.candidates.len());
        for ptr in &self.candidates {
            let store = self.store.as_ref();
            let doc: ClaimCheck<ModelArtifact> = retry_if(&self.retry, |_| get_json(store, &ptr.container, &ptr.key, self.read_timeout), StoreError::is_transient).await?;
            out.push(doc.metadata);
        }
        Ok(out)
    }

    /// Claim-check for the orchestrator: the root pointer plus the record.
    pub async fn write_output(&self, record: &PromotionRecord) -> Result<(), ForecastError> {
        let Some(path) = &self.output_path else { return Ok(()) };
        let doc = ClaimCheck { pointer: ArtifactPointer::new(self.engine.settings().container.clone(), CURRENT_POINTER), metadata: record };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| ForecastError::Config(format!("cannot encode output artifact: {e}")))?;
        let io = |e: std::io::Error| ForecastError::ArtifactStore(StoreError::Io { container: "local".into(), key: path.display().to_string(), source: e });
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) { tokio::fs::create_dir_all(parent).await.map_err(io)?; }
        tokio::fs::write(path, bytes).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl Runner for BatchRunner {
    async fn run(self: Box<Self>) -> Result<()> {
        let candidates = self.load_candidates().await?;
        let record = self.engine.evaluate(&self.config_hash, &self.identifier, &candidates, &self.weights).await?;
        self.write_output(&record).await?;
        info!(run_id = %record.run_id, "batch promotion complete");
        Ok(())
    }
}

/// Long-running HTTP service accepting `POST /evaluate`.
pub struct ServiceRunner { pub engine: Arc<PromotionEngine>, pub port: u16, pub default_weights: ScoreWeights }

#[async_trait]
impl Runner for ServiceRunner {
    async fn run(self: Box<Self>) -> Result<()> {
        forecast_core::mark_ready();
        let app = router(AppState { engine: self.engine, default_weights: self.default_weights });
        tokio::select! {
            res = forecast_core::serve(self.port, app) => res,
            _ = tokio::signal::ctrl_c() => { info!("shutdown"); Ok(()) }
        }
    }
}

pub fn select_runner(cfg: &PipelineConfig, engine: Arc<PromotionEngine>, store: Arc<dyn ArtifactStore>) -> Result<Box<dyn Runner>, ForecastError> {
    match cfg.mode {
        ExecutionMode::Service => Ok(Box::new(ServiceRunner { engine, port: cfg.eval.port, default_weights: cfg.eval.weights })),
        ExecutionMode::Batch => {
            let config_hash = cfg.eval.config_hash.clone().filter(|h| !h.trim().is_empty())
                .ok_or_else(|| ForecastError::Config("eval.config_hash is required in batch mode".into()))?;
            let candidates = cfg.eval.candidates.iter().map(|raw| ArtifactPointer::parse(raw).map_err(|e| ForecastError::Config(e.to_string()))).collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(BatchRunner {
                engine,
                store,
                config_hash: ConfigHash::new(config_hash),
                identifier: cfg.identifier.clone(),
                candidates,
                weights: cfg.eval.weights,
                output_path: cfg.eval.output_path.clone(),
                retry: cfg.store.retry.to_retry_config(),
                read_timeout: cfg.store.write_timeout(),
            }))
        }
    }
}
