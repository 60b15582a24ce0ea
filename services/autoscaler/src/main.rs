use anyhow::Result;
use autoscaler::{ControlLoop, ControlSettings, HttpStatsSource, StateFileSink};
use forecast_core::{init_metrics, init_tracing, load_pipeline_config, mark_ready, shutdown_tracer, start_health_server, ForecastError, ScalingPolicy};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let outcome = run().await;
    shutdown_tracer();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<ForecastError>().map(ForecastError::exit_code).unwrap_or(1);
            error!(error = %e, code, "autoscaler failed");
            ExitCode::from(code as u8)
        }
    }
}

async fn run() -> Result<()> {
    init_tracing("autoscaler")?;
    init_metrics()?;
    let cfg = load_pipeline_config()?;
    let a = &cfg.autoscale;
    info!(targets = ?a.targets, min = a.min_replicas, max = a.max_replicas, state = %a.state_path.display(), "config loaded");
    start_health_server(a.port).await?;

    let settings = ControlSettings::from(a);
    let scrape_timeout = settings.poll_interval.min(Duration::from_secs(5));
    let source = Arc::new(HttpStatsSource::new(&a.targets, scrape_timeout)?);
    let sink = Arc::new(StateFileSink::new(&a.state_path));
    let control = ControlLoop::resume(ScalingPolicy::from(a), source, sink, settings).await;
    mark_ready();

    let looping = tokio::spawn(control.run());
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    looping.abort();
    Ok(())
}
