use anyhow::Result;
use forecast_core::{init_metrics, init_tracing, load_pipeline_config, open_store, shutdown_tracer, ForecastError, LocalRegistry};
use inference_gateway::inference_log::InferenceLog;
use inference_gateway::{select_runner, EngineSettings, InferenceEngine, PromotionWatcher, WatcherSettings};
use once_cell::sync::Lazy;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let outcome = run().await;
    shutdown_tracer();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<ForecastError>().map(ForecastError::exit_code).unwrap_or(1);
            error!(error = %e, code, "inference-gateway failed");
            ExitCode::from(code as u8)
        }
    }
}

async fn run() -> Result<()> {
    init_tracing("inference-gateway")?;
    init_metrics()?;
    Lazy::force(&inference_gateway::telemetry::GATEWAY_METRICS);
    let cfg = load_pipeline_config()?;
    info!(mode = ?cfg.mode, identifier = %cfg.identifier, "config loaded");

    let store = open_store(&cfg.store);
    let registry = Arc::new(LocalRegistry::open(&cfg.registry.path)?);
    let log = cfg.serving.inference_log.then(|| InferenceLog::spawn(store.clone(), cfg.store.inference_log_container.clone(), cfg.store.write_timeout()));
    let engine = InferenceEngine::start(EngineSettings::from_config(&cfg.identifier, &cfg.serving), log);
    let watcher = Arc::new(PromotionWatcher::new(engine.clone(), store.clone(), registry, WatcherSettings::from_config(&cfg)));
    select_runner(&cfg, engine, watcher, store).run().await
}
