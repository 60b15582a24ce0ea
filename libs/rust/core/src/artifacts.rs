//! Pipeline artifacts exchanged between stages and the promotion log layout.
//!
//! Bulk data never travels inline: stages hand each other claim-check documents
//! (`{"pointer": "<container>/<key>", "metadata": {...}}`) and the payload stays
//! in the artifact store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ForecastError;

/// Scope name used when a promotion carries no identifier.
pub const GLOBAL_SCOPE: &str = "global";
pub const CURRENT_POINTER: &str = "current.json";

/// Deterministic fingerprint of a preprocessing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    /// Hash the canonical JSON form of `config`. Object keys are sorted by
    /// `serde_json::Value`, so field order in the source never changes the hash.
    pub fn of<T: Serialize>(config: &T) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_value(config)?;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self(hex::encode(Sha256::digest(&bytes))))
    }

    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConfigHash { fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) } }

/// `(container, key)` address of a blob in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactPointer { pub container: String, pub key: String }

impl ArtifactPointer {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self { Self { container: container.into(), key: key.into() } }

    /// Parse `<container>/<key>`; the key may itself contain slashes.
    pub fn parse(raw: &str) -> Result<Self, ForecastError> {
        let raw = raw.trim().trim_start_matches('/');
        match raw.split_once('/') {
            Some((c, k)) if !c.is_empty() && !k.is_empty() => Ok(Self::new(c, k)),
            _ => Err(ForecastError::InvalidRequest(format!("artifact pointer {raw:?} is not <container>/<key>"))),
        }
    }
}

impl fmt::Display for ArtifactPointer { fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.container, self.key) } }

impl Serialize for ArtifactPointer {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.collect_str(self) }
}

impl<'de> Deserialize<'de> for ArtifactPointer {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Claim-check envelope passed between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCheck<M> {
    pub pointer: ArtifactPointer,
    pub metadata: M,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetArtifact {
    pub pointer: ArtifactPointer,
    pub row_count: usize,
    #[serde(default)]
    pub schema: BTreeMap<String, String>,
    pub config_hash: ConfigHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics { pub rmse: f64, pub mae: f64, pub mse: f64 }

/// Output contract of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub registry_handle: String,
    pub model_variant: String,
    pub run_id: String,
    pub config_hash: ConfigHash,
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights { pub rmse: f64, pub mae: f64, pub mse: f64 }

impl Default for ScoreWeights { fn default() -> Self { Self { rmse: 0.5, mae: 0.3, mse: 0.2 } } }

impl ScoreWeights {
    pub fn validate(&self) -> Result<(), ForecastError> {
        let parts = [self.rmse, self.mae, self.mse];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) { return Err(ForecastError::Config(format!("score weights must be non-negative: {self:?}"))); }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 { return Err(ForecastError::Config(format!("score weights must sum to 1.0, got {sum}"))); }
        Ok(())
    }

    pub fn score(&self, m: &Metrics) -> f64 { self.rmse * m.rmse + self.mae * m.mae + self.mse * m.mse }
}

/// One promotion decision, persisted verbatim in the history log and behind
/// every "current" pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub identifier: String,
    pub config_hash: ConfigHash,
    pub run_id: String,
    pub model_variant: String,
    pub registry_handle: String,
    #[serde(flatten)]
    pub metrics: Metrics,
    #[serde(rename = "score")]
    pub composite_score: f64,
    pub weights: ScoreWeights,
    pub timestamp: DateTime<Utc>,
}

impl PromotionRecord {
    /// Filesystem-safe form of the decision timestamp.
    pub fn timestamp_key(&self) -> String { self.timestamp.format("%Y-%m-%dT%H-%M-%S%.6fZ").to_string() }
}

/// Empty identifiers fall back to the global scope.
pub fn scope_name(identifier: &str) -> &str { let t = identifier.trim(); if t.is_empty() { GLOBAL_SCOPE } else { t } }

/// `{scope}/{config_hash}/promotion-{ts}.json`
pub fn history_key(scope: &str, config_hash: &ConfigHash, ts_key: &str) -> String { format!("{scope}/{config_hash}/promotion-{ts_key}.json") }

/// Granularities at which a "current" pointer is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerScope {
    Root,
    Global,
    Identifier(String),
    Lineage { identifier: String, config_hash: ConfigHash },
}

impl PointerScope {
    pub fn key(&self) -> String {
        match self {
            PointerScope::Root => CURRENT_POINTER.to_string(),
            PointerScope::Global => format!("{GLOBAL_SCOPE}/{CURRENT_POINTER}"),
            PointerScope::Identifier(id) => format!("{}/{CURRENT_POINTER}", scope_name(id)),
            PointerScope::Lineage { identifier, config_hash } => format!("{}/{config_hash}/{CURRENT_POINTER}", scope_name(identifier)),
        }
    }

    /// Pointer a serving instance for `identifier` should follow.
    pub fn for_serving(identifier: &str) -> Self {
        if identifier.trim().is_empty() { PointerScope::Root } else { PointerScope::Identifier(identifier.trim().to_string()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Serialize)]
    struct Prep { resample: &'static str, lags: Vec<u32> }

    #[test]
    fn config_hash_is_stable() {
        let a = ConfigHash::of(&Prep { resample: "1h", lags: vec![1, 24] }).unwrap();
        let b = ConfigHash::of(&Prep { resample: "1h", lags: vec![1, 24] }).unwrap();
        let c = ConfigHash::of(&Prep { resample: "15min", lags: vec![1, 24] }).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        let reordered = serde_json::json!({"lags": [1, 24], "resample": "1h"});
        assert_eq!(ConfigHash::of(&reordered).unwrap(), a);
    }

    #[test]
    fn pointer_parse_and_claim_check_json() {
        let p = ArtifactPointer::parse("processed-data/abc/dataset.json").unwrap();
        assert_eq!(p.container, "processed-data");
        assert_eq!(p.key, "abc/dataset.json");
        assert!(ArtifactPointer::parse("nokey").is_err());
        let cc = ClaimCheck { pointer: p, metadata: serde_json::json!({"rows": 10}) };
        let v = serde_json::to_value(&cc).unwrap();
        assert_eq!(v, serde_json::json!({"pointer": "processed-data/abc/dataset.json", "metadata": {"rows": 10}}));
    }

    #[test]
    fn weights_validation() {
        assert!(ScoreWeights::default().validate().is_ok());
        assert!(ScoreWeights { rmse: 0.5, mae: 0.5, mse: 0.5 }.validate().is_err());
        assert!(ScoreWeights { rmse: 1.2, mae: -0.2, mse: 0.0 }.validate().is_err());
    }

    #[test]
    fn record_json_is_flat() {
        let rec = PromotionRecord {
            identifier: "site-a".into(), config_hash: ConfigHash::new("h1"), run_id: "r1".into(), model_variant: "GRU".into(),
            registry_handle: "runs:/r1/GRU".into(), metrics: Metrics { rmse: 0.12, mae: 0.09, mse: 0.015 }, composite_score: 0.0825,
            weights: ScoreWeights::default(), timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        for field in ["identifier", "config_hash", "run_id", "model_variant", "registry_handle", "rmse", "mae", "mse", "score", "timestamp", "weights"] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(rec.timestamp_key(), "2024-05-01T12-30-00.000000Z");
        let back: PromotionRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn pointer_layout() {
        let h = ConfigHash::new("h1");
        assert_eq!(PointerScope::Root.key(), "current.json");
        assert_eq!(PointerScope::Global.key(), "global/current.json");
        assert_eq!(PointerScope::Identifier("site-a".into()).key(), "site-a/current.json");
        assert_eq!(PointerScope::Identifier(" ".into()).key(), "global/current.json");
        assert_eq!(PointerScope::Lineage { identifier: "site-a".into(), config_hash: h.clone() }.key(), "site-a/h1/current.json");
        assert_eq!(history_key("global", &h, "ts"), "global/h1/promotion-ts.json");
    }
}
