//! Best-effort JSONL log of fresh predictions, written off the request path.

use chrono::{DateTime, Utc};
use forecast_core::{scope_name, ArtifactStore, StoreError};
use forecast_resilience::CircuitBreaker;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceLogEntry {
    pub identifier: String,
    pub run_id: String,
    pub model_variant: String,
    pub window: String,
    pub horizon: usize,
    pub prediction_hash: String,
    pub predictions: Vec<f64>,
    pub logged_at: DateTime<Utc>,
}

pub fn prediction_hash(run_id: &str, window: &str, values: &[f64]) -> String {
    let mut h = Sha256::new();
    h.update(run_id.as_bytes());
    h.update([0u8]);
    h.update(window.as_bytes());
    for v in values { h.update(v.to_bits().to_le_bytes()); }
    hex::encode(h.finalize())
}

/// `<identifier>/<YYYYMMDD>/results.jsonl`
pub fn log_key(identifier: &str, at: &DateTime<Utc>) -> String { format!("{}/{}/results.jsonl", scope_name(identifier), at.format("%Y%m%d")) }

#[derive(Clone)]
pub struct InferenceLog { tx: mpsc::Sender<InferenceLogEntry> }

type EntryId = (String, String);

struct Writer {
    store: Arc<dyn ArtifactStore>,
    container: String,
    timeout: Duration,
    breaker: CircuitBreaker,
    /// Daily file the `seen` set belongs to.
    day: Option<String>,
    seen: HashSet<EntryId>,
}

impl InferenceLog {
    pub fn spawn(store: Arc<dyn ArtifactStore>, container: impl Into<String>, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<InferenceLogEntry>(1024);
        let mut writer = Writer::new(store, container.into(), timeout);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await { writer.write(entry).await; }
        });
        Self { tx }
    }

    /// Queue one entry; dropped when the writer is saturated.
    pub fn record(&self, entry: InferenceLogEntry) {
        if self.tx.try_send(entry).is_err() { debug!("inference log saturated, entry dropped"); }
    }
}

impl Writer {
    fn new(store: Arc<dyn ArtifactStore>, container: String, timeout: Duration) -> Self {
        Self { store, container, timeout, breaker: CircuitBreaker::new(5, Duration::from_secs(30)), day: None, seen: HashSet::new() }
    }

    async fn write(&mut self, entry: InferenceLogEntry) {
        let key = log_key(&entry.identifier, &entry.logged_at);
        let id = (entry.run_id.clone(), entry.prediction_hash.clone());
        let fresh_day = self.day.as_deref() != Some(key.as_str());
        if !fresh_day && self.seen.contains(&id) { return; }

        let (store, container, timeout) = (self.store.clone(), self.container.clone(), self.timeout);
        let res = self.breaker.call(|| async move {
            tokio::time::timeout(timeout, async {
                // a new daily file starts a new set, seeded from whatever an earlier process wrote
                let seeded = if fresh_day { Some(logged_ids(store.as_ref(), &container, &key).await?) } else { None };
                let duplicate = seeded.as_ref().map(|ids| ids.contains(&(entry.run_id.clone(), entry.prediction_hash.clone()))).unwrap_or(false);
                if !duplicate {
                    let mut line = serde_json::to_vec(&entry).map_err(|source| StoreError::Decode { container: container.clone(), key: key.clone(), source })?;
                    line.push(b'\n');
                    store.append(&container, &key, &line).await?;
                }
                Ok::<_, StoreError>((key, seeded))
            }).await.map_err(|_| StoreError::Timeout(timeout))?
        }).await;
        match res {
            Ok(Ok((key, seeded))) => {
                if let Some(ids) = seeded { self.seen = ids; self.day = Some(key); }
                self.seen.insert(id);
            }
            Ok(Err(e)) => warn!(error = %e, "inference log write failed"),
            Err(_) => debug!("inference log circuit open, entry skipped"),
        }
    }
}

/// Entries already present in one daily file.
async fn logged_ids(store: &dyn ArtifactStore, container: &str, key: &str) -> Result<HashSet<EntryId>, StoreError> {
    let existing = match store.get(container, key).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound { .. }) => return Ok(HashSet::new()),
        Err(e) => return Err(e),
    };
    Ok(existing.split(|b| *b == b'\n').filter_map(|line| serde_json::from_slice::<InferenceLogEntry>(line).ok())
        .map(|e| (e.run_id, e.prediction_hash)).collect())
}
