//! Layered configuration: struct defaults, then the file named by
//! `FORECAST_CONFIG_FILE`, then `FORECAST__*` environment variables
//! (`FORECAST__SERVING__QUEUE__CAPACITY=200`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::artifacts::ScoreWeights;
use crate::error::ForecastError;
use forecast_resilience::RetryConfig;

pub const CONFIG_FILE_ENV: &str = "FORECAST_CONFIG_FILE";
pub const ENV_PREFIX: &str = "FORECAST";

/// How a binary runs: once to completion, or as a long-lived service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode { #[default] Service, Batch }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend { #[default] Fs, Memory }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings { pub max_retries: usize, pub base_delay_ms: u64, pub max_delay_ms: u64 }

impl Default for RetrySettings { fn default() -> Self { Self { max_retries: 3, base_delay_ms: 50, max_delay_ms: 1500 } } }

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig { max_retries: self.max_retries, base_delay: Duration::from_millis(self.base_delay_ms), max_delay: Duration::from_millis(self.max_delay_ms), ..RetryConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub root: PathBuf,
    pub promotion_container: String,
    pub dataset_container: String,
    /// `{config_hash}` is substituted.
    pub dataset_key_template: String,
    pub inference_log_container: String,
    pub write_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Fs,
            root: PathBuf::from("./data/artifacts"),
            promotion_container: "model-promotion".into(),
            dataset_container: "processed-data".into(),
            dataset_key_template: "{config_hash}/dataset.json".into(),
            inference_log_container: "inference-logs".into(),
            write_timeout_ms: 5_000,
            retry: RetrySettings::default(),
        }
    }
}

impl StoreConfig {
    pub fn write_timeout(&self) -> Duration { Duration::from_millis(self.write_timeout_ms) }
    pub fn dataset_key(&self, config_hash: &str) -> String { self.dataset_key_template.replace("{config_hash}", config_hash) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig { pub path: PathBuf, pub load_timeout_ms: u64, pub allow_unpromoted_fallback: bool }

impl Default for RegistryConfig { fn default() -> Self { Self { path: PathBuf::from("./data/registry"), load_timeout_ms: 10_000, allow_unpromoted_fallback: false } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub expected_variants: Vec<String>,
    pub weights: ScoreWeights,
    /// Batch mode only.
    pub config_hash: Option<String>,
    /// Batch mode: claim-check documents as `<container>/<key>`.
    pub candidates: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub port: u16,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self { expected_variants: vec!["GRU".into(), "LSTM".into(), "PROPHET".into()], weights: ScoreWeights::default(), config_hash: None, candidates: Vec::new(), output_path: None, port: 8050 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig { pub capacity: usize, pub pause_percent: u8, pub resume_percent: u8 }

impl Default for QueueConfig { fn default() -> Self { Self { capacity: 100, pause_percent: 90, resume_percent: 60 } } }

impl QueueConfig {
    pub fn pause_at(&self) -> usize { self.capacity * self.pause_percent as usize / 100 }
    pub fn resume_below(&self) -> usize { self.capacity * self.resume_percent as usize / 100 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig { pub enabled: bool, pub max_batch_size: usize, pub flush_timeout_ms: u64 }

impl Default for BatchConfig { fn default() -> Self { Self { enabled: false, max_batch_size: 16, flush_timeout_ms: 20 } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig { pub enabled: bool, pub max_entries: usize }

impl Default for CacheConfig { fn default() -> Self { Self { enabled: true, max_entries: 10_000 } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub port: u16,
    pub workers: usize,
    pub request_timeout_ms: u64,
    pub model_wait_timeout_ms: u64,
    pub max_horizon: usize,
    pub prewarm: bool,
    pub poll_interval_ms: u64,
    pub latency_window_secs: u64,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub inference_log: bool,
    pub memory_limit_bytes: Option<u64>,
    /// Batch mode: window to forecast once before exiting.
    pub batch_window_start: usize,
    pub batch_horizon: usize,
    pub batch_output: Option<PathBuf>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            request_timeout_ms: 30_000,
            model_wait_timeout_ms: 120_000,
            max_horizon: 10_000,
            prewarm: true,
            poll_interval_ms: 10_000,
            latency_window_secs: 30,
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            inference_log: false,
            memory_limit_bytes: None,
            batch_window_start: 0,
            batch_horizon: 24,
            batch_output: None,
        }
    }
}

impl ServingConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
    pub fn model_wait_timeout(&self) -> Duration { Duration::from_millis(self.model_wait_timeout_ms) }
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms.max(1)) }
    pub fn flush_timeout(&self) -> Duration { Duration::from_millis(self.batch.flush_timeout_ms) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub poll_interval_secs: u64,
    pub latency_activation_ms: f64,
    pub latency_hard_ms: f64,
    pub queue_hard_cap: f64,
    pub queue_low_water: f64,
    pub cpu_high: f64,
    pub memory_high: f64,
    pub cpu_low: f64,
    pub scale_up_window_secs: u64,
    pub queue_window_secs: u64,
    pub scale_down_window_secs: u64,
    pub scale_up_percent: f64,
    pub scale_up_pods: u32,
    pub scale_down_pods: u32,
    pub scale_down_latency_ratio: f64,
    pub stale_after_secs: u64,
    pub action_timeout_secs: u64,
    pub targets: Vec<String>,
    pub state_path: PathBuf,
    pub port: u16,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            poll_interval_secs: 15,
            latency_activation_ms: 500.0,
            latency_hard_ms: 2_000.0,
            queue_hard_cap: 50.0,
            queue_low_water: 5.0,
            cpu_high: 0.85,
            memory_high: 0.90,
            cpu_low: 0.30,
            scale_up_window_secs: 30,
            queue_window_secs: 0,
            scale_down_window_secs: 300,
            scale_up_percent: 0.5,
            scale_up_pods: 2,
            scale_down_pods: 1,
            scale_down_latency_ratio: 0.5,
            stale_after_secs: 45,
            action_timeout_secs: 60,
            targets: vec!["http://127.0.0.1:8000".into()],
            state_path: PathBuf::from("./data/scaling-state.json"),
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub identifier: String,
    pub mode: ExecutionMode,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub eval: EvalConfig,
    pub serving: ServingConfig,
    pub autoscale: AutoscaleConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ForecastError> {
        let bad = |msg: String| Err(ForecastError::Config(msg));
        self.eval.weights.validate()?;
        if self.eval.expected_variants.is_empty() { return bad("eval.expected_variants must not be empty".into()); }
        let q = &self.serving.queue;
        if q.capacity == 0 { return bad("serving.queue.capacity must be positive".into()); }
        if q.pause_percent == 0 || q.pause_percent > 100 { return bad(format!("serving.queue.pause_percent {} outside 1..=100", q.pause_percent)); }
        if q.resume_percent >= q.pause_percent { return bad(format!("serving.queue.resume_percent {} must be below pause_percent {}", q.resume_percent, q.pause_percent)); }
        if self.serving.workers == 0 { return bad("serving.workers must be positive".into()); }
        if self.serving.batch.max_batch_size == 0 { return bad("serving.batch.max_batch_size must be positive".into()); }
        if self.serving.max_horizon == 0 { return bad("serving.max_horizon must be positive".into()); }
        let a = &self.autoscale;
        if a.min_replicas == 0 || a.min_replicas > a.max_replicas { return bad(format!("autoscale replica bounds [{}, {}] invalid", a.min_replicas, a.max_replicas)); }
        if a.poll_interval_secs == 0 || a.scale_down_window_secs == 0 { return bad("autoscale poll interval and scale-down window must be positive".into()); }
        if a.scale_up_pods == 0 || a.scale_down_pods == 0 { return bad("autoscale step sizes must be positive".into()); }
        if !(0.0..=1.0).contains(&a.scale_down_latency_ratio) { return bad("autoscale.scale_down_latency_ratio must be within 0..=1".into()); }
        Ok(())
    }
}

/// Build and validate the layered configuration from the process environment.
pub fn load_pipeline_config() -> Result<PipelineConfig, ForecastError> {
    load_config_from(std::env::var(CONFIG_FILE_ENV).ok().as_deref(), None)
}

/// Defaults, then `file`, then `FORECAST__*` variables. A named file must
/// exist. `env` stands in for the process environment when given.
pub fn load_config_from(file: Option<&str>, env: Option<config::Map<String, String>>) -> Result<PipelineConfig, ForecastError> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
        builder = builder.add_source(config::File::with_name(file).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("eval.expected_variants")
            .with_list_parse_key("eval.candidates")
            .with_list_parse_key("autoscale.targets")
            .source(env),
    );
    let cfg: PipelineConfig = builder.build().and_then(|c| c.try_deserialize()).map_err(|e| ForecastError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}
