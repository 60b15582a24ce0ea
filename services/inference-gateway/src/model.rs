//! The currently served model and the serving lifecycle around it.

use arc_swap::ArcSwapOption;
use forecast_core::{ConfigHash, FeatureFrame, ForecastError, ForecastModel};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::telemetry::GATEWAY_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    /// Nothing could be loaded; requests wait for a model up to their deadline.
    Degraded,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self { ModelState::Unloaded => "UNLOADED", ModelState::Loading => "LOADING", ModelState::Ready => "READY", ModelState::Degraded => "DEGRADED" }
    }
}

pub struct LoadedModel {
    pub model: Arc<dyn ForecastModel>,
    pub run_id: String,
    pub model_variant: String,
    pub config_hash: Option<ConfigHash>,
    /// Handle the model was actually loaded from.
    pub handle: String,
    /// Reference series `window_start` indexes into.
    pub frame: Option<Arc<FeatureFrame>>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel").field("run_id", &self.run_id).field("model_variant", &self.model_variant).field("handle", &self.handle).field("frame_rows", &self.frame.as_ref().map(|fr| fr.len())).finish()
    }
}

/// Atomic model handle. Readers get either the old or the new model, never a
/// mix, and a failed reload leaves the old one serving.
pub struct ModelSlot {
    current: ArcSwapOption<LoadedModel>,
    state: RwLock<ModelState>,
    ready: watch::Sender<bool>,
}

impl Default for ModelSlot { fn default() -> Self { Self::new() } }

impl ModelSlot {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self { current: ArcSwapOption::empty(), state: RwLock::new(ModelState::Unloaded), ready }
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> { self.current.load_full() }

    pub fn current_run_id(&self) -> Option<String> { self.current.load().as_ref().map(|m| m.run_id.clone()) }

    pub fn state(&self) -> ModelState { *self.state.read() }

    pub fn is_ready(&self) -> bool { self.current.load().is_some() }

    pub fn begin_load(&self) {
        if !self.is_ready() { *self.state.write() = ModelState::Loading; }
    }

    /// Swap in `model`, returning whatever served before.
    pub fn install(&self, model: Arc<LoadedModel>) -> Option<Arc<LoadedModel>> {
        let previous = self.current.swap(Some(model));
        *self.state.write() = ModelState::Ready;
        self.ready.send_replace(true);
        GATEWAY_METRICS.model_ready.set(1);
        previous
    }

    pub fn load_failed(&self) {
        *self.state.write() = if self.is_ready() { ModelState::Ready } else { ModelState::Degraded };
    }

    pub fn unload(&self) -> Option<Arc<LoadedModel>> {
        let previous = self.current.swap(None);
        *self.state.write() = ModelState::Unloaded;
        self.ready.send_replace(false);
        GATEWAY_METRICS.model_ready.set(0);
        previous
    }

    /// The current model, waiting up to `limit` for the first one to arrive.
    pub async fn wait_ready(&self, limit: Duration) -> Result<Arc<LoadedModel>, ForecastError> {
        if let Some(m) = self.current() { return Ok(m); }
        let mut rx = self.ready.subscribe();
        let arrived = matches!(tokio::time::timeout(limit, rx.wait_for(|ready| *ready)).await, Ok(Ok(_)));
        if !arrived { return Err(ForecastError::ModelUnavailable); }
        self.current().ok_or(ForecastError::ModelUnavailable)
    }
}
