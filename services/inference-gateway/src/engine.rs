//! Inference serving engine.
//!
//! `predict` admits the request through the backpressure gate, hands it to
//! the worker pool over a bounded queue and waits for the answer with a
//! deadline. Workers resolve the feature window through the shared window
//! code, consult the prediction cache, and call the model directly or via
//! the microbatcher.

use chrono::{NaiveDateTime, Utc};
use forecast_core::config::ServingConfig;
use forecast_core::{FeatureFrame, FeatureWindow, ForecastError, ForecastInput, HealthStatus, Series, ServingStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::admission::{AdmissionGate, GateLimits, Permit};
use crate::batcher::{invoke_one, MicroBatcher};
use crate::cache::{PredictionCache, PredictionKey};
use crate::inference_log::{prediction_hash, InferenceLog, InferenceLogEntry};
use crate::model::{LoadedModel, ModelSlot, ModelState};
use crate::telemetry::{LatencyWindow, ResourceProbe, GATEWAY_METRICS};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub identifier: String,
    pub workers: usize,
    pub request_timeout: Duration,
    pub model_wait_timeout: Duration,
    pub max_horizon: usize,
    pub prewarm: bool,
    pub limits: GateLimits,
    /// `(max_batch_size, flush_timeout)` when microbatching is on.
    pub batch: Option<(usize, Duration)>,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub latency_window: Duration,
    pub memory_limit_bytes: Option<u64>,
}

impl EngineSettings {
    pub fn from_config(identifier: &str, c: &ServingConfig) -> Self {
        Self {
            identifier: identifier.to_string(),
            workers: c.workers.max(1),
            request_timeout: c.request_timeout(),
            model_wait_timeout: c.model_wait_timeout(),
            max_horizon: c.max_horizon,
            prewarm: c.prewarm,
            limits: GateLimits::from(&c.queue),
            batch: c.batch.enabled.then(|| (c.batch.max_batch_size, c.flush_timeout())),
            cache_enabled: c.cache.enabled,
            cache_max_entries: c.cache.max_entries,
            latency_window: Duration::from_secs(c.latency_window_secs.max(1)),
            memory_limit_bytes: c.memory_limit_bytes,
        }
    }
}

impl Default for EngineSettings { fn default() -> Self { Self::from_config("", &ServingConfig::default()) } }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub window_start: usize,
    pub horizon: usize,
    /// Inline history to forecast from instead of the reference dataset.
    #[serde(default)]
    pub series: Option<Series>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    #[serde(with = "naive_ts")]
    pub ts: NaiveDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predictions: Vec<ForecastPoint>,
    pub run_id: String,
    pub model_variant: String,
}

mod naive_ts {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FMT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> { s.serialize_str(&ts.format(FMT).to_string()) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        forecast_core::window::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

struct Job {
    req: PredictRequest,
    admitted: Instant,
    reply: oneshot::Sender<Result<Prediction, ForecastError>>,
    _permit: Permit,
}

pub struct InferenceEngine {
    settings: EngineSettings,
    gate: AdmissionGate,
    queue: mpsc::Sender<Job>,
    slot: ModelSlot,
    cache: PredictionCache,
    batcher: Option<MicroBatcher>,
    latency: LatencyWindow,
    probe: ResourceProbe,
    /// Run id of the last model warmed up.
    warmed: Mutex<Option<String>>,
    log: Option<InferenceLog>,
}

impl InferenceEngine {
    /// Build the engine and start its worker pool. Workers exit once the
    /// engine is dropped.
    pub fn start(settings: EngineSettings, log: Option<InferenceLog>) -> Arc<Self> {
        let capacity = settings.limits.capacity.max(1);
        let (queue, rx) = mpsc::channel::<Job>(capacity);
        let batcher = settings.batch.map(|(size, flush)| MicroBatcher::spawn(size, flush, capacity));
        let engine = Arc::new(Self {
            gate: AdmissionGate::with_peak_window(settings.limits, settings.latency_window),
            queue,
            slot: ModelSlot::new(),
            cache: PredictionCache::new(settings.cache_enabled, settings.cache_max_entries),
            batcher,
            latency: LatencyWindow::new(settings.latency_window),
            probe: ResourceProbe::new(settings.memory_limit_bytes),
            warmed: Mutex::new(None),
            log,
            settings,
        });
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for id in 0..engine.settings.workers {
            tokio::spawn(worker(id, Arc::downgrade(&engine), rx.clone()));
        }
        info!(workers = engine.settings.workers, capacity, batching = engine.batcher.is_some(), "inference engine started");
        engine
    }

    pub fn settings(&self) -> &EngineSettings { &self.settings }
    pub fn gate(&self) -> &AdmissionGate { &self.gate }
    pub fn cache(&self) -> &PredictionCache { &self.cache }
    pub fn slot(&self) -> &ModelSlot { &self.slot }
    pub fn current_model(&self) -> Option<Arc<LoadedModel>> { self.slot.current() }
    pub fn is_ready(&self) -> bool { self.slot.is_ready() }

    pub fn health(&self) -> HealthStatus {
        match self.slot.state() { ModelState::Ready => HealthStatus::Healthy, _ => HealthStatus::Degraded }
    }

    #[instrument(skip_all, fields(window_start = req.window_start, horizon = req.horizon))]
    pub async fn predict(&self, req: PredictRequest) -> Result<Prediction, ForecastError> {
        if req.horizon == 0 || req.horizon > self.settings.max_horizon {
            GATEWAY_METRICS.requests.with_label_values(&["invalid"]).inc();
            return Err(ForecastError::InvalidRequest(format!("horizon {} outside 1..={}", req.horizon, self.settings.max_horizon)));
        }
        let started = Instant::now();
        let res = self.submit(req).await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(ForecastError::RequestOverloaded { .. }) => "rejected",
            Err(ForecastError::InvalidRequest(_)) => "invalid",
            Err(ForecastError::ModelUnavailable) => "unavailable",
            Err(ForecastError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        // every admitted request counts toward p95, failures and timeouts included
        if outcome != "rejected" {
            let elapsed = started.elapsed();
            GATEWAY_METRICS.latency.observe(elapsed.as_secs_f64());
            self.latency.record(elapsed);
        }
        GATEWAY_METRICS.requests.with_label_values(&[outcome]).inc();
        res
    }

    async fn submit(&self, req: PredictRequest) -> Result<Prediction, ForecastError> {
        let permit = self.gate.try_admit().map_err(|e| { GATEWAY_METRICS.rejected.inc(); e })?;
        let (reply, rx) = oneshot::channel();
        let job = Job { req, admitted: Instant::now(), reply, _permit: permit };
        if let Err(e) = self.queue.try_send(job) {
            GATEWAY_METRICS.rejected.inc();
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => ForecastError::RequestOverloaded { occupancy: self.gate.occupancy(), capacity: self.settings.limits.capacity },
                mpsc::error::TrySendError::Closed(_) => ForecastError::Inference("worker pool stopped".into()),
            });
        }
        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(ForecastError::Inference("request dropped by worker".into())),
            Err(_) => Err(ForecastError::Timeout { op: "predict", after: self.settings.request_timeout }),
        }
    }

    async fn handle(&self, req: &PredictRequest) -> Result<Prediction, ForecastError> {
        let model = self.slot.wait_ready(self.settings.model_wait_timeout).await?;
        let seq_len = model.model.metadata().input_seq_len;
        let window = resolve_window(&model, req, seq_len)?;
        let stamps = window.forecast_timestamps(req.horizon)?;
        let key = PredictionKey { run_id: model.run_id.clone(), window: window.fingerprint(), horizon: req.horizon };

        let values = match self.cache.get(&key) {
            Some(hit) => hit,
            None => {
                let input = ForecastInput { window: window.clone(), horizon: req.horizon };
                let out = match &self.batcher {
                    Some(b) => b.infer(model.clone(), input).await,
                    None => invoke_one(model.model.clone(), input).await,
                }.map_err(|e| {
                    warn!(run_id = %model.run_id, error = %e, "inference failed");
                    ForecastError::from(e)
                })?;
                if out.len() != req.horizon {
                    return Err(ForecastError::Inference(format!("model returned {} steps for horizon {}", out.len(), req.horizon)));
                }
                let out = Arc::new(out);
                // entries for a model that was swapped out meanwhile would never hit again
                if self.slot.current_run_id().as_deref() == Some(model.run_id.as_str()) { self.cache.insert(key.clone(), out.clone()); }
                if let Some(log) = &self.log {
                    log.record(InferenceLogEntry {
                        identifier: self.settings.identifier.clone(),
                        run_id: model.run_id.clone(),
                        model_variant: model.model_variant.clone(),
                        prediction_hash: prediction_hash(&model.run_id, &key.window, &out),
                        window: key.window,
                        horizon: req.horizon,
                        predictions: out.to_vec(),
                        logged_at: Utc::now(),
                    });
                }
                out
            }
        };
        let predictions = stamps.into_iter().zip(values.iter()).map(|(ts, value)| ForecastPoint { ts, value: *value }).collect();
        Ok(Prediction { predictions, run_id: model.run_id.clone(), model_variant: model.model_variant.clone() })
    }

    pub fn begin_load(&self) { self.slot.begin_load(); }
    pub fn load_failed(&self) { self.slot.load_failed(); }

    /// Warm `model` up, swap it in and drop cached predictions of the old one.
    pub async fn install(&self, model: LoadedModel) -> Arc<LoadedModel> {
        let model = Arc::new(model);
        if self.settings.prewarm { self.prewarm(&model).await; }
        let previous = self.slot.install(model.clone());
        self.cache.clear();
        info!(run_id = %model.run_id, previous = previous.as_ref().map(|p| p.run_id.as_str()).unwrap_or("none"), "model installed");
        model
    }

    /// One throwaway call on the newest window. Reinstalling the run already
    /// warmed is a no-op.
    pub async fn prewarm(&self, model: &LoadedModel) -> bool {
        if self.warmed.lock().as_deref() == Some(model.run_id.as_str()) { return false; }
        let Some(frame) = &model.frame else { debug!(run_id = %model.run_id, "no reference data, prewarm skipped"); return false };
        let meta = model.model.metadata();
        let window = match frame.tail_window(meta.input_seq_len) {
            Ok(w) => w,
            Err(e) => { warn!(run_id = %model.run_id, error = %e, "prewarm window unavailable"); return false; }
        };
        let started = Instant::now();
        match invoke_one(model.model.clone(), ForecastInput { window, horizon: meta.output_seq_len.max(1) }).await {
            Ok(_) => info!(run_id = %model.run_id, elapsed_ms = started.elapsed().as_millis() as u64, "prewarm complete"),
            Err(e) => warn!(run_id = %model.run_id, error = %e, "prewarm call failed"),
        }
        *self.warmed.lock() = Some(model.run_id.clone());
        true
    }

    pub fn stats(&self) -> ServingStats {
        let gate = self.gate.stats();
        let (p95, n) = self.latency.p95();
        let cache = self.cache.stats();
        let (cpu, memory) = self.probe.sample();
        let current = self.slot.current();
        ServingStats {
            p95_latency_ms: p95,
            queue_depth: gate.occupancy,
            queue_peak: gate.peak,
            queue_capacity: gate.capacity,
            paused: gate.paused,
            model_state: self.slot.state().as_str().to_string(),
            model_ready: current.is_some(),
            run_id: current.as_ref().map(|m| m.run_id.clone()),
            model_variant: current.as_ref().map(|m| m.model_variant.clone()),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            requests_in_window: n,
            cpu_utilization: cpu,
            memory_utilization: memory,
        }
    }
}

/// Exact model input for `req`: the inline series when given, else the
/// model's reference dataset. Out-of-range starts clamp to the last full window.
pub fn resolve_window(model: &LoadedModel, req: &PredictRequest, seq_len: usize) -> Result<FeatureWindow, ForecastError> {
    let inline;
    let frame: &FeatureFrame = match &req.series {
        Some(series) => { inline = FeatureFrame::from_series(series)?; &inline }
        None => model.frame.as_deref().ok_or_else(|| ForecastError::InvalidRequest("no reference dataset loaded for this model; send an inline series".into()))?,
    };
    let start = frame.clamp_start(req.window_start, seq_len)?;
    if start != req.window_start {
        info!(requested = req.window_start, used = start, rows = frame.len(), "adjust_start_index");
    }
    Ok(frame.window(start, seq_len)?)
}

async fn worker(id: usize, engine: Weak<InferenceEngine>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        let Some(engine) = engine.upgrade() else { break };
        GATEWAY_METRICS.queue_wait.observe(job.admitted.elapsed().as_secs_f64());
        if job.reply.is_closed() { continue; }
        let res = engine.handle(&job.req).await;
        let _ = job.reply.send(res);
    }
    debug!(worker = id, "inference worker stopped");
}
