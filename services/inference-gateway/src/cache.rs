//! Prediction cache keyed by run, input window and horizon.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::telemetry::GATEWAY_METRICS;

/// Identity of one prediction: the model run, the exact input window and the
/// number of steps asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredictionKey {
    pub run_id: String,
    pub window: String,
    pub horizon: usize,
}

/// Concurrent prediction cache. A miss on one key never blocks another key.
pub struct PredictionCache {
    entries: DashMap<PredictionKey, Arc<Vec<f64>>>,
    max_entries: usize,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats { pub entries: usize, pub hits: u64, pub misses: u64 }

impl PredictionCache {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        Self { entries: DashMap::new(), max_entries: max_entries.max(1), enabled, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn get(&self, key: &PredictionKey) -> Option<Arc<Vec<f64>>> {
        if !self.enabled { return None; }
        match self.entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                GATEWAY_METRICS.cache_hits.inc();
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                GATEWAY_METRICS.cache_misses.inc();
                None
            }
        }
    }

    pub fn insert(&self, key: PredictionKey, value: Arc<Vec<f64>>) {
        if !self.enabled { return; }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            // the ref into the map must be gone before remove, or the shard deadlocks
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim { self.entries.remove(&victim); }
        }
        self.entries.insert(key, value);
    }

    /// Drop everything, used when the serving model changes.
    pub fn clear(&self) { self.entries.clear(); }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn stats(&self) -> CacheStats {
        CacheStats { entries: self.entries.len(), hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed) }
    }
}
