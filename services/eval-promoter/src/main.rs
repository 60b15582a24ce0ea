use anyhow::Result;
use eval_promoter::{select_runner, PromotionEngine, PromotionSettings};
use forecast_core::{init_metrics, init_tracing, load_pipeline_config, open_store, shutdown_tracer, ForecastError, LocalRegistry};
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
            error!(error = %e, code, "eval-promoter failed");
            ExitCode::from(code as u8)
        }
    }
}

async fn run() -> Result<()> {
    init_tracing("eval-promoter")?;
    init_metrics()?;
    let cfg = load_pipeline_config()?;
    info!(mode = ?cfg.mode, identifier = %cfg.identifier, "config loaded");

    let store = open_store(&cfg.store);
    let registry = Arc::new(LocalRegistry::open(&cfg.registry.path)?);
    let engine = Arc::new(PromotionEngine::new(store.clone(), registry, PromotionSettings::from_config(&cfg)));
    select_runner(&cfg, engine, store)?.run().await
}
