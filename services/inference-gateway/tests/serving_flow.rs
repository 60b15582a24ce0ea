mod common;

use common::*;
use forecast_core::{ForecastError, Runner};
use inference_gateway::{BatchRunner, ModelState, PredictRequest, ReloadStatus};
use std::time::Duration;

fn req(start: usize, horizon: usize) -> PredictRequest { PredictRequest { window_start: start, horizon, series: None } }

#[tokio::test]
async fn serves_the_promoted_model_over_the_reference_window() {
    let fx = Fixture::new(settings()).with_dataset(100).await;
    fx.register(run_record("r1", 0, "GRU"), true).await;
    fx.point_at("r1").await;

    let report = fx.watcher.poll_once().await;
    assert_eq!(report.status, ReloadStatus::Loaded);
    assert_eq!(report.run_id.as_deref(), Some("r1"));
    assert_eq!(fx.engine.slot().state(), ModelState::Ready);

    let p = fx.engine.predict(req(10, 3)).await.unwrap();
    assert_eq!(p.run_id, "r1");
    assert_eq!(p.model_variant, "GRU");
    // window rows 10..34, persistence repeats row 33
    let values: Vec<f64> = p.predictions.iter().map(|pt| pt.value).collect();
    assert_eq!(values, vec![33.0, 33.0, 33.0]);
    assert_eq!(p.predictions[0].ts.to_string(), "2024-01-02 10:00:00");

    assert_eq!(fx.watcher.poll_once().await.status, ReloadStatus::Unchanged);
}

#[tokio::test]
async fn out_of_range_start_clamps_to_last_full_window() {
    let fx = Fixture::new(settings());
    fx.engine.install(loaded("r1", CountingModel::new(), 50)).await;
    let p = fx.engine.predict(req(10_000, 1)).await.unwrap();
    assert_eq!(p.predictions[0].value, 49.0);
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let fx = Fixture::new(settings());
    let model = CountingModel::new();
    fx.engine.install(loaded("r1", model.clone(), 100)).await;

    let a = fx.engine.predict(req(5, 4)).await.unwrap();
    let b = fx.engine.predict(req(5, 4)).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(model.calls(), 1);
    assert_eq!(fx.engine.cache().stats().hits, 1);

    fx.engine.predict(req(5, 5)).await.unwrap();
    assert_eq!(model.calls(), 2, "horizon is part of the key");
}

#[tokio::test]
async fn reload_replaces_model_and_clears_cache() {
    let fx = Fixture::new(settings()).with_dataset(100).await;
    fx.register(run_record("r1", 0, "GRU"), true).await;
    fx.register(run_record("r2", 5, "GRU"), true).await;
    fx.point_at("r1").await;
    fx.watcher.poll_once().await;
    fx.engine.predict(req(0, 2)).await.unwrap();
    assert_eq!(fx.engine.cache().len(), 1);

    fx.point_at("r2").await;
    let report = fx.watcher.poll_once().await;
    assert_eq!(report.status, ReloadStatus::Loaded);
    assert!(fx.engine.cache().is_empty());
    assert_eq!(fx.engine.predict(req(0, 2)).await.unwrap().run_id, "r2");
}

#[tokio::test]
async fn failed_reload_keeps_the_old_model_serving() {
    let fx = Fixture::new(settings()).with_dataset(100).await;
    fx.register(run_record("r1", 0, "GRU"), true).await;
    fx.point_at("r1").await;
    fx.watcher.poll_once().await;

    fx.point_at("ghost").await;
    let report = fx.watcher.poll_once().await;
    assert_eq!(report.status, ReloadStatus::NotLoaded);
    assert!(report.error.is_some());
    assert_eq!(fx.engine.slot().state(), ModelState::Ready);
    assert_eq!(fx.engine.predict(req(0, 1)).await.unwrap().run_id, "r1");
}

#[tokio::test]
async fn registry_tag_is_the_second_discovery_path() {
    let fx = Fixture::new(settings()).with_dataset(60).await;
    // artifact stored under the conventional path rather than the variant name
    fx.register(run_record("r7", 0, "model"), true).await;
    fx.register(run_record("r8", 9, "model"), false).await;

    let report = fx.watcher.poll_once().await;
    assert_eq!(report.status, ReloadStatus::Loaded);
    assert_eq!(report.run_id.as_deref(), Some("r7"));
    assert_eq!(fx.engine.current_model().unwrap().handle, "runs:/r7/model");
}

#[tokio::test]
async fn nothing_to_load_degrades_without_crashing() {
    let mut s = settings();
    s.model_wait_timeout = Duration::from_millis(20);
    let fx = Fixture::new(s);
    let report = fx.watcher.poll_once().await;
    assert_eq!(report.status, ReloadStatus::NotLoaded);
    assert_eq!(fx.engine.slot().state(), ModelState::Degraded);
    assert!(!fx.engine.is_ready());
    let err = fx.engine.predict(req(0, 1)).await.unwrap_err();
    assert!(matches!(err, ForecastError::ModelUnavailable));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn backpressure_pauses_then_drains_without_loss() {
    let fx = Fixture::new(settings());
    // no model yet: workers park every admitted request
    let mut pending = Vec::new();
    for i in 0..91 {
        let engine = fx.engine.clone();
        pending.push(tokio::spawn(async move { engine.predict(req(i % 50, 1)).await }));
    }
    while fx.engine.gate().occupancy() < 91 { tokio::task::yield_now().await; }
    assert!(fx.engine.gate().is_paused());
    assert!(matches!(fx.engine.predict(req(0, 1)).await, Err(ForecastError::RequestOverloaded { .. })));

    fx.engine.install(loaded("r1", CountingModel::new(), 100)).await;
    for p in pending { p.await.unwrap().unwrap(); }
    assert_eq!(fx.engine.gate().occupancy(), 0);
    assert!(!fx.engine.gate().is_paused());
    assert!(fx.engine.predict(req(0, 1)).await.is_ok());
}

#[tokio::test]
async fn microbatching_returns_each_caller_its_own_slice() {
    let mut s = settings();
    s.batch = Some((4, Duration::from_millis(500)));
    let fx = Fixture::new(s);
    let model = CountingModel::new();
    fx.engine.install(loaded("r1", model.clone(), 100)).await;

    let handles: Vec<_> = [0usize, 10, 20, 30].into_iter().map(|start| {
        let engine = fx.engine.clone();
        tokio::spawn(async move { (start, engine.predict(req(start, 2)).await) })
    }).collect();
    for h in handles {
        let (start, res) = h.await.unwrap();
        let p = res.unwrap();
        assert_eq!(p.predictions[0].value, (start + SEQ_LEN - 1) as f64);
    }
    assert_eq!(*model.batches.lock(), vec![4]);
}

#[tokio::test]
async fn inline_series_with_offsets_matches_naive_utc() {
    let fx = Fixture::new(settings());
    fx.engine.install(loaded("r1", CountingModel::new(), 100)).await;

    let mut utc = hourly(30);
    let mut shifted = utc.clone();
    shifted.timestamps = utc.timestamps.iter().map(|t| {
        let naive = chrono::NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").unwrap();
        (naive + chrono::TimeDelta::hours(2)).format("%Y-%m-%dT%H:%M:%S+02:00").to_string()
    }).collect();
    utc.columns.insert("load".into(), vec![1.0; 30]);
    shifted.columns = utc.columns.clone();

    let a = fx.engine.predict(PredictRequest { window_start: 0, horizon: 2, series: Some(utc) }).await.unwrap();
    let b = fx.engine.predict(PredictRequest { window_start: 0, horizon: 2, series: Some(shifted) }).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(fx.engine.cache().stats().hits, 1, "same window after normalisation");

    let mut ragged = hourly(30);
    ragged.columns.insert("load".into(), vec![1.0; 3]);
    let err = fx.engine.predict(PredictRequest { window_start: 0, horizon: 2, series: Some(ragged) }).await.unwrap_err();
    assert!(matches!(err, ForecastError::InvalidRequest(_)));
    let err = fx.engine.predict(PredictRequest { window_start: 0, horizon: 2, series: Some(hourly(5)) }).await.unwrap_err();
    assert!(matches!(err, ForecastError::InvalidRequest(_)), "too short for the model");
}

#[tokio::test]
async fn horizon_bounds_are_enforced() {
    let fx = Fixture::new(settings());
    assert!(matches!(fx.engine.predict(req(0, 0)).await, Err(ForecastError::InvalidRequest(_))));
    assert!(matches!(fx.engine.predict(req(0, 49)).await, Err(ForecastError::InvalidRequest(_))));
}

#[tokio::test]
async fn prewarm_runs_once_per_run() {
    let mut s = settings();
    s.prewarm = true;
    let fx = Fixture::new(s);
    let model = CountingModel::new();
    fx.engine.install(loaded("r1", model.clone(), 100)).await;
    assert_eq!(model.calls(), 1);
    fx.engine.install(loaded("r1", model.clone(), 100)).await;
    assert_eq!(model.calls(), 1);
    fx.engine.install(loaded("r2", model.clone(), 100)).await;
    assert_eq!(model.calls(), 2);
    // only the latest run is remembered
    fx.engine.install(loaded("r1", model.clone(), 100)).await;
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn stats_reflect_queue_and_model() {
    let fx = Fixture::new(settings());
    fx.engine.install(loaded("r1", CountingModel::new(), 100)).await;
    fx.engine.predict(req(0, 1)).await.unwrap();
    let s = fx.engine.stats();
    assert!(s.model_ready);
    assert_eq!(s.model_state, "READY");
    assert_eq!(s.run_id.as_deref(), Some("r1"));
    assert_eq!(s.queue_depth, 0);
    assert_eq!(s.queue_capacity, 100);
    assert!(s.queue_peak >= 1);
    assert_eq!(s.requests_in_window, 1);
    assert_eq!(s.cache_misses, 1);
}

#[tokio::test]
async fn timed_out_requests_count_toward_p95() {
    let mut s = settings();
    s.request_timeout = Duration::from_millis(300);
    let fx = Fixture::new(s);
    for i in 0..3 {
        let err = fx.engine.predict(req(i, 1)).await.unwrap_err();
        assert!(matches!(err, ForecastError::Timeout { .. }));
    }
    let stats = fx.engine.stats();
    assert_eq!(stats.requests_in_window, 3);
    assert!(stats.p95_latency_ms >= 300.0, "p95 was {}", stats.p95_latency_ms);
    assert_eq!(stats.queue_peak, 3);
    assert_eq!(fx.engine.stats().queue_peak, 3, "reading stats does not reset the peak");
}

#[tokio::test]
async fn rejected_requests_stay_out_of_the_latency_window() {
    let fx = Fixture::new(settings());
    assert!(fx.engine.predict(req(0, 0)).await.is_err());
    assert_eq!(fx.engine.stats().requests_in_window, 0);
}

fn batch_runner(fx: &Fixture, output: Option<std::path::PathBuf>) -> BatchRunner {
    BatchRunner {
        watcher: fx.watcher.clone(),
        store: fx.store.clone(),
        container: "inference-logs".into(),
        identifier: "site-a".into(),
        request: req(0, 3),
        output_path: output,
        write_timeout: T,
    }
}

#[tokio::test]
async fn batch_mode_writes_forecast_and_claim_check() {
    let fx = Fixture::new(settings()).with_dataset(100).await;
    fx.register(run_record("r1", 0, "GRU"), true).await;
    fx.point_at("r1").await;
    let out = std::env::temp_dir().join(format!("forecast-{}.json", std::process::id()));
    Box::new(batch_runner(&fx, Some(out.clone()))).run().await.unwrap();

    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    let pointer = doc["pointer"].as_str().unwrap().to_string();
    assert!(pointer.starts_with("inference-logs/site-a/batch/r1-"));
    assert_eq!(doc["metadata"]["horizon"], 3);
    let keys = fx.store.keys("inference-logs");
    assert_eq!(keys.len(), 1);
    let _ = std::fs::remove_file(out);
}

#[tokio::test]
async fn batch_mode_without_a_loadable_model_exits_with_load_failure() {
    let fx = Fixture::new(settings());
    let err = Box::new(batch_runner(&fx, None)).run().await.unwrap_err();
    assert_eq!(err.downcast_ref::<ForecastError>().map(ForecastError::exit_code), Some(4));
}
