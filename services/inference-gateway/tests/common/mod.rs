#![allow(dead_code)]

use chrono::{NaiveDate, TimeDelta, TimeZone, Utc};
use forecast_core::config::StoreConfig;
use forecast_core::model_registry::PROMOTED_TAG;
use forecast_core::store::put_json;
use forecast_core::{ConfigHash, FeatureFrame, ForecastInput, ForecastModel, LocalRegistry, MemoryStore, Metrics, ModelError, ModelMetadata, ModelRegistry, ModelSpec, PointerScope, PromotionRecord, RunRecord, ScoreWeights, Series};
use forecast_resilience::RetryConfig;
use inference_gateway::{EngineSettings, GateLimits, InferenceEngine, LoadedModel, PromotionWatcher, WatcherSettings};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const SEQ_LEN: usize = 24;
pub const T: Duration = Duration::from_secs(1);

pub fn meta() -> ModelMetadata { ModelMetadata { input_seq_len: SEQ_LEN, output_seq_len: 6, target: "value".into() } }

/// `rows` hourly points whose value equals the row index.
pub fn hourly(rows: usize) -> Series {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let timestamps = (0..rows).map(|i| (start + TimeDelta::hours(i as i64)).format("%Y-%m-%dT%H:%M:%S").to_string()).collect();
    let mut columns = BTreeMap::new();
    columns.insert("value".to_string(), (0..rows).map(|i| i as f64).collect());
    Series { timestamps, columns }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        identifier: String::new(),
        workers: 4,
        request_timeout: Duration::from_secs(10),
        model_wait_timeout: Duration::from_secs(10),
        max_horizon: 48,
        prewarm: false,
        limits: GateLimits { capacity: 100, pause_at: 90, resume_below: 60 },
        batch: None,
        cache_enabled: true,
        cache_max_entries: 1_000,
        latency_window: Duration::from_secs(30),
        memory_limit_bytes: None,
    }
}

/// Repeats the last target value and records every call's batch size.
pub struct CountingModel { meta: ModelMetadata, pub batches: Mutex<Vec<usize>> }

impl CountingModel {
    pub fn new() -> Arc<Self> { Arc::new(Self { meta: meta(), batches: Mutex::new(Vec::new()) }) }
    pub fn calls(&self) -> usize { self.batches.lock().len() }
}

impl ForecastModel for CountingModel {
    fn variant(&self) -> &str { "GRU" }
    fn metadata(&self) -> &ModelMetadata { &self.meta }
    fn predict(&self, inputs: &[ForecastInput]) -> Result<Vec<Vec<f64>>, ModelError> {
        self.batches.lock().push(inputs.len());
        inputs.iter().map(|i| {
            let last = *i.window.column("value").and_then(|c| c.last()).ok_or_else(|| ModelError::MissingTarget("value".into()))?;
            Ok(vec![last; i.horizon])
        }).collect()
    }
}

pub fn loaded(run: &str, model: Arc<dyn ForecastModel>, rows: usize) -> LoadedModel {
    LoadedModel {
        model,
        run_id: run.into(),
        model_variant: "GRU".into(),
        config_hash: Some(ConfigHash::new("h1")),
        handle: format!("runs:/{run}/GRU"),
        frame: Some(Arc::new(FeatureFrame::from_series(&hourly(rows)).unwrap())),
    }
}

pub fn run_record(run: &str, minute: u32, artifact_path: &str) -> RunRecord {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, minute, 0).unwrap();
    let mut artifacts = BTreeMap::new();
    artifacts.insert(artifact_path.to_string(), ModelSpec::Persistence { variant: "GRU".into(), metadata: meta() });
    RunRecord {
        run_id: run.into(), model_variant: "GRU".into(), config_hash: ConfigHash::new("h1"), params: BTreeMap::new(),
        metrics: Some(Metrics { rmse: 0.1, mae: 0.1, mse: 0.01 }), tags: BTreeMap::new(), created_at: at, finished_at: Some(at), artifacts,
    }
}

pub fn record(run: &str) -> PromotionRecord {
    PromotionRecord {
        identifier: "global".into(), config_hash: ConfigHash::new("h1"), run_id: run.into(), model_variant: "GRU".into(),
        registry_handle: format!("runs:/{run}/GRU"), metrics: Metrics { rmse: 0.1, mae: 0.1, mse: 0.01 }, composite_score: 0.082,
        weights: ScoreWeights::default(), timestamp: Utc::now(),
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<LocalRegistry>,
    pub engine: Arc<InferenceEngine>,
    pub watcher: Arc<PromotionWatcher>,
}

impl Fixture {
    pub fn new(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(LocalRegistry::temporary().unwrap());
        let engine = InferenceEngine::start(settings, None);
        let watcher_settings = WatcherSettings {
            identifier: String::new(),
            store: StoreConfig::default(),
            load_timeout: T,
            allow_unpromoted_fallback: false,
            retry: RetryConfig { max_retries: 1, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.0 },
            poll_interval: Duration::from_secs(3600),
        };
        let watcher = Arc::new(PromotionWatcher::new(engine.clone(), store.clone(), registry.clone(), watcher_settings));
        Self { store, registry, engine, watcher }
    }

    pub async fn with_dataset(self, rows: usize) -> Self {
        put_json(self.store.as_ref(), "processed-data", "h1/dataset.json", &hourly(rows), T).await.unwrap();
        self
    }

    pub async fn register(&self, run: RunRecord, promoted: bool) {
        let id = run.run_id.clone();
        self.registry.record_run(run).await.unwrap();
        if promoted { self.registry.set_tag(&id, PROMOTED_TAG, "true").await.unwrap(); }
    }

    pub async fn point_at(&self, run: &str) {
        put_json(self.store.as_ref(), "model-promotion", &PointerScope::Root.key(), &record(run), T).await.unwrap();
    }
}
