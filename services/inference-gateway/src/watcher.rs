//! Promotion discovery and model (re)loading.
//!
//! The "current" pointer is the primary signal. When it cannot be read the
//! registry's `promoted=true` tag is the second path. A new run is loaded
//! from the first handle candidate that works; when none does, whatever
//! already serves keeps serving.

use forecast_core::config::StoreConfig;
use forecast_core::model_registry::{handle_candidates, PROMOTED_TAG};
use forecast_core::store::get_json;
use forecast_core::{ArtifactStore, ConfigHash, DatasetArtifact, FeatureFrame, ForecastError, ModelRegistry, PipelineConfig, PointerScope, PromotionRecord, Series, StoreError};
use forecast_resilience::{retry_if, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::engine::InferenceEngine;
use crate::model::LoadedModel;
use crate::telemetry::GATEWAY_METRICS;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub identifier: String,
    pub store: StoreConfig,
    pub load_timeout: Duration,
    pub allow_unpromoted_fallback: bool,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
}

impl WatcherSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            identifier: cfg.identifier.clone(),
            store: cfg.store.clone(),
            load_timeout: Duration::from_millis(cfg.registry.load_timeout_ms),
            allow_unpromoted_fallback: cfg.registry.allow_unpromoted_fallback,
            retry: cfg.store.retry.to_retry_config(),
            poll_interval: cfg.serving.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStatus { Loaded, Unchanged, NotLoaded }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub status: ReloadStatus,
    pub run_id: Option<String>,
    pub model_variant: Option<String>,
    pub config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReloadReport {
    fn of(status: ReloadStatus, m: &LoadedModel) -> Self {
        Self { status, run_id: Some(m.run_id.clone()), model_variant: Some(m.model_variant.clone()), config_hash: m.config_hash.as_ref().map(|h| h.to_string()), error: None }
    }

    fn failed(e: &ForecastError) -> Self {
        Self { status: ReloadStatus::NotLoaded, run_id: None, model_variant: None, config_hash: None, error: Some(e.to_string()) }
    }
}

/// What the latest promotion says should be served.
#[derive(Debug, Clone, PartialEq)]
struct Target { run_id: String, model_variant: String, config_hash: Option<ConfigHash>, handle: String }

/// Objects under the dataset key are either the series itself or a
/// claim-check pointing at it.
#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetDoc { Inline(Series), Pointer(DatasetArtifact) }

pub struct PromotionWatcher {
    engine: Arc<InferenceEngine>,
    store: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ModelRegistry>,
    settings: WatcherSettings,
    poll_lock: tokio::sync::Mutex<()>,
}

impl PromotionWatcher {
    pub fn new(engine: Arc<InferenceEngine>, store: Arc<dyn ArtifactStore>, registry: Arc<dyn ModelRegistry>, settings: WatcherSettings) -> Self {
        Self { engine, store, registry, settings, poll_lock: tokio::sync::Mutex::new(()) }
    }

    pub fn engine(&self) -> &Arc<InferenceEngine> { &self.engine }

    /// One discovery + load cycle. Manual reloads and the poll loop never overlap.
    #[instrument(skip(self), fields(identifier = %self.settings.identifier))]
    pub async fn poll_once(&self) -> ReloadReport {
        let _cycle = self.poll_lock.lock().await;
        let target = match self.discover().await {
            Ok(t) => t,
            Err(e) => {
                GATEWAY_METRICS.model_loads.with_label_values(&["failed"]).inc();
                self.engine.load_failed();
                warn!(error = %e, "no promotion to serve");
                return ReloadReport::failed(&e);
            }
        };
        if let Some(current) = self.engine.current_model() {
            if current.run_id == target.run_id {
                GATEWAY_METRICS.model_loads.with_label_values(&["unchanged"]).inc();
                debug!(run_id = %current.run_id, "promotion unchanged");
                return ReloadReport::of(ReloadStatus::Unchanged, &current);
            }
        }
        self.engine.begin_load();
        match self.load(&target).await {
            Ok(model) => {
                let model = self.engine.install(model).await;
                GATEWAY_METRICS.model_loads.with_label_values(&["loaded"]).inc();
                ReloadReport::of(ReloadStatus::Loaded, &model)
            }
            Err(e) => {
                GATEWAY_METRICS.model_loads.with_label_values(&["failed"]).inc();
                self.engine.load_failed();
                warn!(run_id = %target.run_id, error = %e, serving = self.engine.current_model().map(|m| m.run_id.clone()).unwrap_or_default(), "model load failed, retrying next poll");
                ReloadReport::failed(&e)
            }
        }
    }

    /// Poll forever on the configured interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let _ = self.poll_once().await;
        }
    }

    async fn discover(&self) -> Result<Target, ForecastError> {
        let key = PointerScope::for_serving(&self.settings.identifier).key();
        let store = self.store.as_ref();
        let container = self.settings.store.promotion_container.as_str();
        let limit = self.settings.store.write_timeout();
        let read = retry_if(&self.settings.retry, |_| get_json::<PromotionRecord>(store, container, &key, limit), StoreError::is_transient).await;
        match read {
            Ok(record) => Ok(Target { run_id: record.run_id, model_variant: record.model_variant, config_hash: Some(record.config_hash), handle: record.registry_handle }),
            Err(e) => {
                warn!(key = %key, error = %e, "promotion pointer unavailable, asking the registry");
                self.discover_in_registry().await
            }
        }
    }

    async fn discover_in_registry(&self) -> Result<Target, ForecastError> {
        let mut runs = self.registry.search_runs(Some((PROMOTED_TAG, "true"))).await?;
        if runs.is_empty() && self.settings.allow_unpromoted_fallback {
            runs = self.registry.search_runs(None).await?;
            if !runs.is_empty() { warn!("no promoted run, falling back to the most recent run"); }
        }
        let run = runs.into_iter().next().ok_or_else(|| ForecastError::ModelLoad { handles: Vec::new(), reason: "no promotion pointer and no promoted run in the registry".into() })?;
        Ok(Target { handle: run.handle(&run.model_variant), run_id: run.run_id, model_variant: run.model_variant, config_hash: Some(run.config_hash) })
    }

    async fn load(&self, target: &Target) -> Result<LoadedModel, ForecastError> {
        let handles = handle_candidates(&target.handle, &target.run_id);
        let mut reason = String::from("no handle to try");
        for handle in &handles {
            match tokio::time::timeout(self.settings.load_timeout, self.registry.load_model(handle)).await {
                Ok(Ok(model)) => {
                    info!(run_id = %target.run_id, handle = %handle, variant = model.variant(), "model loaded");
                    let frame = match &target.config_hash { Some(h) => self.load_dataset(h).await, None => None };
                    return Ok(LoadedModel { model, run_id: target.run_id.clone(), model_variant: target.model_variant.clone(), config_hash: target.config_hash.clone(), handle: handle.clone(), frame });
                }
                Ok(Err(e)) => { warn!(handle = %handle, error = %e, "handle did not load"); reason = e.to_string(); }
                Err(_) => { warn!(handle = %handle, "model load timed out"); reason = format!("load timed out after {:?}", self.settings.load_timeout); }
            }
        }
        Err(ForecastError::ModelLoad { handles, reason })
    }

    async fn load_dataset(&self, config_hash: &ConfigHash) -> Option<Arc<FeatureFrame>> {
        let cfg = &self.settings.store;
        let key = cfg.dataset_key(config_hash.as_str());
        let read = async {
            let series = match get_json::<DatasetDoc>(self.store.as_ref(), &cfg.dataset_container, &key, cfg.write_timeout()).await? {
                DatasetDoc::Inline(series) => series,
                DatasetDoc::Pointer(doc) => get_json::<Series>(self.store.as_ref(), &doc.pointer.container, &doc.pointer.key, cfg.write_timeout()).await?,
            };
            Ok::<_, ForecastError>(FeatureFrame::from_series(&series)?)
        };
        match read.await {
            Ok(frame) => { info!(rows = frame.len(), key = %key, "reference dataset loaded"); Some(Arc::new(frame)) }
            Err(e) => { warn!(key = %key, error = %e, "reference dataset unavailable; requests must carry a series"); None }
        }
    }
}
