use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use forecast_core::store::put_json;
use forecast_core::{scope_name, ArtifactPointer, ArtifactStore, ClaimCheck, ExecutionMode, ForecastError, PipelineConfig, Runner, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::engine::{InferenceEngine, PredictRequest, Prediction};
use crate::http::{router, AppState};
use crate::watcher::{PromotionWatcher, ReloadStatus};

/// Load the promoted model once, forecast one window, write the result and exit.
pub struct BatchRunner {
    pub watcher: Arc<PromotionWatcher>,
    pub store: Arc<dyn ArtifactStore>,
    pub container: String,
    pub identifier: String,
    pub request: PredictRequest,
    pub output_path: Option<PathBuf>,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchForecastMeta { pub run_id: String, pub model_variant: String, pub horizon: usize, pub window_start: usize }

impl BatchRunner {
    pub async fn forecast(&self) -> Result<(ArtifactPointer, Prediction), ForecastError> {
        let report = self.watcher.poll_once().await;
        if report.status == ReloadStatus::NotLoaded {
            return Err(ForecastError::ModelLoad { handles: Vec::new(), reason: report.error.unwrap_or_else(|| "no model loaded".into()) });
        }
        let prediction = self.watcher.engine().predict(self.request.clone()).await?;
        let key = format!("{}/batch/{}-{}.json", scope_name(&self.identifier), prediction.run_id, Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
        let pointer = put_json(self.store.as_ref(), &self.container, &key, &prediction, self.write_timeout).await?;
        Ok((pointer, prediction))
    }
}

#[async_trait]
impl Runner for BatchRunner {
    async fn run(self: Box<Self>) -> Result<()> {
        let (pointer, prediction) = self.forecast().await?;
        if let Some(path) = &self.output_path {
            let doc = ClaimCheck {
                pointer: pointer.clone(),
                metadata: BatchForecastMeta { run_id: prediction.run_id.clone(), model_variant: prediction.model_variant.clone(), horizon: self.request.horizon, window_start: self.request.window_start },
            };
            let io = |e: std::io::Error| ForecastError::ArtifactStore(StoreError::Io { container: "local".into(), key: path.display().to_string(), source: e });
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) { tokio::fs::create_dir_all(parent).await.map_err(io)?; }
            let bytes = serde_json::to_vec_pretty(&doc)?;
            tokio::fs::write(path, bytes).await.map_err(io)?;
        }
        info!(run_id = %prediction.run_id, pointer = %pointer, points = prediction.predictions.len(), "batch forecast complete");
        Ok(())
    }
}

/// Poll for promotions in the background and serve HTTP until ctrl-c.
pub struct ServiceRunner { pub engine: Arc<InferenceEngine>, pub watcher: Arc<PromotionWatcher>, pub port: u16 }

#[async_trait]
impl Runner for ServiceRunner {
    async fn run(self: Box<Self>) -> Result<()> {
        let poller = tokio::spawn(self.watcher.clone().run());
        let app = router(AppState { engine: self.engine.clone(), watcher: self.watcher.clone() });
        let res = tokio::select! {
            res = forecast_core::serve(self.port, app) => res,
            _ = tokio::signal::ctrl_c() => { info!("shutdown"); Ok(()) }
        };
        poller.abort();
        res
    }
}

pub fn select_runner(cfg: &PipelineConfig, engine: Arc<InferenceEngine>, watcher: Arc<PromotionWatcher>, store: Arc<dyn ArtifactStore>) -> Box<dyn Runner> {
    match cfg.mode {
        ExecutionMode::Service => Box::new(ServiceRunner { engine, watcher, port: cfg.serving.port }),
        ExecutionMode::Batch => Box::new(BatchRunner {
            watcher,
            store,
            container: cfg.store.inference_log_container.clone(),
            identifier: cfg.identifier.clone(),
            request: PredictRequest { window_start: cfg.serving.batch_window_start, horizon: cfg.serving.batch_horizon, series: None },
            output_path: cfg.serving.batch_output.clone(),
            write_timeout: cfg.store.write_timeout(),
        }),
    }
}
