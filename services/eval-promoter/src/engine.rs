//! Fan-in point of the pipeline: scores the candidate models of one config
//! hash, persists the decision and tags the winner.
//!
//! Callers invoke [`PromotionEngine::evaluate`] only once every training run
//! for the config hash has produced its `ModelArtifact`. The engine checks that
//! structurally (the expected variant set must be present as arguments) and
//! never tracks completion itself.

use chrono::{DateTime, Utc};
use forecast_core::artifacts::{history_key, scope_name, GLOBAL_SCOPE};
use forecast_core::model_registry::{PROMOTED_AT_TAG, PROMOTED_TAG};
use forecast_core::store::put_json;
use forecast_core::{ArtifactStore, ConfigHash, ForecastError, ModelArtifact, ModelRegistry, PipelineConfig, PointerScope, PromotionRecord, ScoreWeights, StoreError, EXTENDED_METRICS};
use forecast_resilience::{retry_if, RetryConfig};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PromotionSettings {
    pub container: String,
    pub expected_variants: Vec<String>,
    pub retry: RetryConfig,
    pub write_timeout: Duration,
}

impl PromotionSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            container: cfg.store.promotion_container.clone(),
            expected_variants: cfg.eval.expected_variants.clone(),
            retry: cfg.store.retry.to_retry_config(),
            write_timeout: cfg.store.write_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreboardRow {
    pub run_id: String,
    pub model_variant: String,
    pub rmse: f64,
    pub mae: f64,
    pub mse: f64,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Candidates best-first: lowest score, then earliest `created_at`, then
/// smallest `run_id`.
pub fn rank_candidates(candidates: &[ModelArtifact], weights: &ScoreWeights) -> Vec<(usize, ScoreboardRow)> {
    let mut rows: Vec<(usize, ScoreboardRow)> = candidates.iter().enumerate().map(|(i, c)| (i, ScoreboardRow {
        run_id: c.run_id.clone(),
        model_variant: c.model_variant.clone(),
        rmse: c.metrics.rmse,
        mae: c.metrics.mae,
        mse: c.metrics.mse,
        score: weights.score(&c.metrics),
        created_at: c.created_at,
    })).collect();
    rows.sort_by(|(_, a), (_, b)| a.score.total_cmp(&b.score).then(a.created_at.cmp(&b.created_at)).then_with(|| a.run_id.cmp(&b.run_id)));
    rows
}

pub struct PromotionEngine {
    store: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ModelRegistry>,
    settings: PromotionSettings,
}

impl PromotionEngine {
    pub fn new(store: Arc<dyn ArtifactStore>, registry: Arc<dyn ModelRegistry>, settings: PromotionSettings) -> Self { Self { store, registry, settings } }

    pub fn settings(&self) -> &PromotionSettings { &self.settings }

    /// Structural precondition. Never touches the store.
    pub fn check_candidates(&self, config_hash: &ConfigHash, candidates: &[ModelArtifact], weights: &ScoreWeights) -> Result<(), ForecastError> {
        let expected: BTreeSet<&str> = self.settings.expected_variants.iter().map(String::as_str).collect();
        let received: Vec<String> = candidates.iter().map(|c| c.model_variant.clone()).collect();
        let present: BTreeSet<&str> = received.iter().map(String::as_str).collect();
        let missing: Vec<String> = expected.difference(&present).map(|s| s.to_string()).collect();
        if candidates.len() < expected.len() || !missing.is_empty() {
            return Err(ForecastError::InsufficientCandidates { config_hash: config_hash.to_string(), missing, received });
        }
        if present.len() != received.len() { return Err(ForecastError::InvalidCandidates(format!("duplicate model variants in {received:?}"))); }
        if let Some(extra) = present.difference(&expected).next() { return Err(ForecastError::InvalidCandidates(format!("unexpected model variant {extra:?}"))); }
        for c in candidates {
            if &c.config_hash != config_hash {
                return Err(ForecastError::InvalidCandidates(format!("run {} belongs to config hash {}, not {config_hash}", c.run_id, c.config_hash)));
            }
            let m = c.metrics;
            if [m.rmse, m.mae, m.mse].iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ForecastError::InvalidCandidates(format!("run {} has invalid metrics {m:?}", c.run_id)));
            }
        }
        weights.validate()
    }

    #[instrument(skip_all, fields(config_hash = %config_hash, identifier = scope_name(identifier)))]
    pub async fn evaluate(&self, config_hash: &ConfigHash, identifier: &str, candidates: &[ModelArtifact], weights: &ScoreWeights) -> Result<PromotionRecord, ForecastError> {
        let metrics = &EXTENDED_METRICS.promotion;
        if let Err(e) = self.check_candidates(config_hash, candidates, weights) {
            let label = if matches!(e, ForecastError::InsufficientCandidates { .. }) { "insufficient" } else { "invalid" };
            metrics.promotions_total.with_label_values(&[label]).inc();
            warn!(error = %e, "promotion aborted, nothing written");
            return Err(e);
        }

        let ranked = rank_candidates(candidates, weights);
        let scoreboard: Vec<&ScoreboardRow> = ranked.iter().map(|(_, row)| row).collect();
        info!(scoreboard = %serde_json::to_string(&scoreboard).unwrap_or_default(), "candidates scored");
        let (winner_idx, best) = &ranked[0];
        let winner = &candidates[*winner_idx];
        let scope = scope_name(identifier).to_string();
        let record = PromotionRecord {
            identifier: scope.clone(),
            config_hash: config_hash.clone(),
            run_id: winner.run_id.clone(),
            model_variant: winner.model_variant.clone(),
            registry_handle: winner.registry_handle.clone(),
            metrics: winner.metrics,
            composite_score: best.score,
            weights: *weights,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.persist(&record, &scope).await {
            metrics.promotions_total.with_label_values(&["store_error"]).inc();
            return Err(e);
        }
        self.tag_winner(&record).await;

        metrics.promotions_total.with_label_values(&["promoted"]).inc();
        metrics.last_score.set(record.composite_score);
        info!(run_id = %record.run_id, model_variant = %record.model_variant, score = record.composite_score, "model promoted");
        Ok(record)
    }

    /// History first, pointers after; a pointer is only written once the
    /// record it names is durable.
    async fn persist(&self, record: &PromotionRecord, scope: &str) -> Result<(), ForecastError> {
        let ts = record.timestamp_key();
        let mut history = vec![history_key(GLOBAL_SCOPE, &record.config_hash, &ts)];
        if scope != GLOBAL_SCOPE { history.push(history_key(scope, &record.config_hash, &ts)); }
        for key in &history { self.write(key, record).await?; }

        let mut pointers = vec![PointerScope::Lineage { identifier: scope.to_string(), config_hash: record.config_hash.clone() }];
        if scope != GLOBAL_SCOPE { pointers.push(PointerScope::Identifier(scope.to_string())); }
        pointers.push(PointerScope::Global);
        pointers.push(PointerScope::Root);
        for pointer in pointers { self.write(&pointer.key(), record).await?; }
        Ok(())
    }

    async fn write(&self, key: &str, record: &PromotionRecord) -> Result<(), ForecastError> {
        let store = self.store.as_ref();
        let container = self.settings.container.as_str();
        let limit = self.settings.write_timeout;
        retry_if(&self.settings.retry, |_| put_json(store, container, key, record, limit), StoreError::is_transient).await?;
        Ok(())
    }

    async fn tag_winner(&self, record: &PromotionRecord) {
        let tags = [(PROMOTED_TAG, "true".to_string()), (PROMOTED_AT_TAG, record.timestamp.to_rfc3339())];
        for (key, value) in tags {
            if let Err(e) = self.registry.set_tag(&record.run_id, key, &value).await {
                EXTENDED_METRICS.promotion.registry_tag_failures.with_label_values(&[key]).inc();
                warn!(run_id = %record.run_id, tag = key, error = %e, "registry tag failed; store pointer remains authoritative");
            }
        }
    }
}
