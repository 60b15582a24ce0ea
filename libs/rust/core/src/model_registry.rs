//! Model registry client: training runs with parameters, metrics, tags and
//! loadable model artifacts addressed by `runs:/<run_id>/<path>` handles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::artifacts::{ConfigHash, Metrics};
use crate::error::{ModelError, RegistryError};
use crate::window::FeatureWindow;

pub const PROMOTED_TAG: &str = "promoted";
pub const PROMOTED_AT_TAG: &str = "promoted_at";
/// Conventional artifact path tried after the handle a promotion names.
pub const DEFAULT_ARTIFACT_PATH: &str = "model";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub input_seq_len: usize,
    pub output_seq_len: usize,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ForecastInput { pub window: FeatureWindow, pub horizon: usize }

/// A loaded, callable model. One call may carry many inputs; outputs are
/// index-aligned with them.
pub trait ForecastModel: Send + Sync {
    fn variant(&self) -> &str;
    fn metadata(&self) -> &ModelMetadata;
    fn predict(&self, inputs: &[ForecastInput]) -> Result<Vec<Vec<f64>>, ModelError>;
}

/// Serialized form of a model artifact. The statistical baselines here let
/// single-node runs serve something without an external training stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Repeats the last observed target value.
    Persistence { variant: String, metadata: ModelMetadata },
    /// Repeats the mean of the window's target values.
    WindowMean { variant: String, metadata: ModelMetadata },
    /// Extends the straight line through the window's first and last value.
    Drift { variant: String, metadata: ModelMetadata },
}

impl ModelSpec {
    pub fn metadata(&self) -> &ModelMetadata {
        match self { ModelSpec::Persistence { metadata, .. } | ModelSpec::WindowMean { metadata, .. } | ModelSpec::Drift { metadata, .. } => metadata }
    }

    pub fn instantiate(&self) -> Arc<dyn ForecastModel> { Arc::new(BaselineModel { spec: self.clone() }) }
}

struct BaselineModel { spec: ModelSpec }

impl BaselineModel {
    fn forecast(&self, target: &[f64], horizon: usize) -> Vec<f64> {
        let last = *target.last().unwrap_or(&0.0);
        match &self.spec {
            ModelSpec::Persistence { .. } => vec![last; horizon],
            ModelSpec::WindowMean { .. } => { let mean = target.iter().sum::<f64>() / target.len().max(1) as f64; vec![mean; horizon] }
            ModelSpec::Drift { .. } => {
                let slope = if target.len() > 1 { (last - target[0]) / (target.len() - 1) as f64 } else { 0.0 };
                (1..=horizon).map(|k| last + slope * k as f64).collect()
            }
        }
    }
}

impl ForecastModel for BaselineModel {
    fn variant(&self) -> &str {
        match &self.spec { ModelSpec::Persistence { variant, .. } | ModelSpec::WindowMean { variant, .. } | ModelSpec::Drift { variant, .. } => variant }
    }

    fn metadata(&self) -> &ModelMetadata { self.spec.metadata() }

    fn predict(&self, inputs: &[ForecastInput]) -> Result<Vec<Vec<f64>>, ModelError> {
        let meta = self.metadata();
        inputs.iter().map(|input| {
            if input.window.len() < meta.input_seq_len { return Err(ModelError::WindowTooShort { needed: meta.input_seq_len, got: input.window.len() }); }
            let target = input.window.column(&meta.target).ok_or_else(|| ModelError::MissingTarget(meta.target.clone()))?;
            Ok(self.forecast(target, input.horizon))
        }).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub model_variant: String,
    pub config_hash: ConfigHash,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Artifact path within the run -> serialized model.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ModelSpec>,
}

impl RunRecord {
    pub fn is_promoted(&self) -> bool { self.tags.get(PROMOTED_TAG).map(|v| v == "true").unwrap_or(false) }
    pub fn sort_time(&self) -> DateTime<Utc> { self.finished_at.unwrap_or(self.created_at) }
    pub fn handle(&self, path: &str) -> String { format!("runs:/{}/{path}", self.run_id) }
}

/// Split `runs:/<run_id>/<path>`.
pub fn parse_handle(handle: &str) -> Result<(&str, &str), RegistryError> {
    let rest = handle.strip_prefix("runs:/").ok_or_else(|| RegistryError::InvalidHandle(handle.to_string()))?;
    match rest.split_once('/') {
        Some((run, path)) if !run.is_empty() && !path.is_empty() => Ok((run, path)),
        _ => Err(RegistryError::InvalidHandle(handle.to_string())),
    }
}

/// Ordered handles to try when loading: the handle as given, then the run's
/// conventional artifact path.
pub fn handle_candidates(handle: &str, run_id: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    if !handle.trim().is_empty() { out.push(handle.trim().to_string()); }
    let fallback = format!("runs:/{run_id}/{DEFAULT_ARTIFACT_PATH}");
    if !run_id.is_empty() && !out.contains(&fallback) { out.push(fallback); }
    out
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn record_run(&self, run: RunRecord) -> Result<(), RegistryError>;
    async fn get_run(&self, run_id: &str) -> Result<RunRecord, RegistryError>;
    async fn load_model(&self, handle: &str) -> Result<Arc<dyn ForecastModel>, RegistryError>;
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<(), RegistryError>;
    /// Finished runs, most recent first, optionally filtered by one tag.
    async fn search_runs(&self, tag: Option<(&str, &str)>) -> Result<Vec<RunRecord>, RegistryError>;
}

/// sled-backed registry for single-node deployments and tests.
pub struct LocalRegistry { runs: sled::Tree, _db: sled::Db }

impl LocalRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn temporary() -> Result<Self, RegistryError> { Self::from_db(sled::Config::new().temporary(true).open()?) }

    fn from_db(db: sled::Db) -> Result<Self, RegistryError> { Ok(Self { runs: db.open_tree("runs")?, _db: db }) }

    fn read(&self, run_id: &str) -> Result<RunRecord, RegistryError> {
        let raw = self.runs.get(run_id.as_bytes())?.ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write(&self, run: &RunRecord) -> Result<(), RegistryError> {
        self.runs.insert(run.run_id.as_bytes(), serde_json::to_vec(run)?)?;
        self.runs.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for LocalRegistry {
    async fn record_run(&self, run: RunRecord) -> Result<(), RegistryError> { self.write(&run) }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, RegistryError> { self.read(run_id) }

    async fn load_model(&self, handle: &str) -> Result<Arc<dyn ForecastModel>, RegistryError> {
        let (run_id, path) = parse_handle(handle)?;
        let run = self.read(run_id)?;
        let spec = run.artifacts.get(path).ok_or_else(|| RegistryError::ArtifactNotFound(handle.to_string()))?;
        Ok(spec.instantiate())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<(), RegistryError> {
        let mut run = self.read(run_id)?;
        run.tags.insert(key.to_string(), value.to_string());
        self.write(&run)
    }

    async fn search_runs(&self, tag: Option<(&str, &str)>) -> Result<Vec<RunRecord>, RegistryError> {
        let mut out = Vec::new();
        for item in self.runs.iter() {
            let (_, raw) = item?;
            let run: RunRecord = serde_json::from_slice(&raw)?;
            if run.finished_at.is_none() { continue; }
            if let Some((k, v)) = tag { if run.tags.get(k).map(String::as_str) != Some(v) { continue; } }
            out.push(run);
        }
        out.sort_by(|a, b| b.sort_time().cmp(&a.sort_time()).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(out)
    }
}
