//! Microbatching: inputs arriving within one flush window, up to the size
//! cap, go to the model as a single call. Each caller gets back exactly its
//! own row of the output.

use forecast_core::{ForecastInput, ForecastModel, ModelError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::LoadedModel;
use crate::telemetry::GATEWAY_METRICS;

/// Run one model call off the async runtime and check the output shape.
pub async fn invoke(model: Arc<dyn ForecastModel>, inputs: Vec<ForecastInput>) -> Result<Vec<Vec<f64>>, ModelError> {
    let n = inputs.len();
    GATEWAY_METRICS.batch_size.observe(n as f64);
    let out = tokio::task::spawn_blocking(move || model.predict(&inputs))
        .await
        .map_err(|e| ModelError::Failed(format!("inference task aborted: {e}")))??;
    if out.len() != n { return Err(ModelError::ShapeMismatch { expected: n, got: out.len() }); }
    Ok(out)
}

pub async fn invoke_one(model: Arc<dyn ForecastModel>, input: ForecastInput) -> Result<Vec<f64>, ModelError> {
    invoke(model, vec![input]).await?.pop().ok_or(ModelError::ShapeMismatch { expected: 1, got: 0 })
}

struct BatchRequest {
    model: Arc<LoadedModel>,
    input: ForecastInput,
    resp: oneshot::Sender<Result<Vec<f64>, ModelError>>,
}

#[derive(Clone)]
pub struct MicroBatcher { tx: mpsc::Sender<BatchRequest> }

impl MicroBatcher {
    /// Start the collector. It flushes when `max_batch` inputs are buffered or
    /// `window` has passed since the first one, whichever comes first.
    pub fn spawn(max_batch: usize, window: Duration, buffer: usize) -> Self {
        let max_batch = max_batch.max(1);
        let (tx, mut rx) = mpsc::channel::<BatchRequest>(buffer.max(1));
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut reqs = vec![first];
                let deadline = Instant::now() + window;
                while reqs.len() < max_batch {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(r)) => reqs.push(r),
                        _ => break,
                    }
                }
                debug!(size = reqs.len(), "flushing batch");
                tokio::spawn(run_batch(reqs));
            }
        });
        Self { tx }
    }

    pub async fn infer(&self, model: Arc<LoadedModel>, input: ForecastInput) -> Result<Vec<f64>, ModelError> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(BatchRequest { model, input, resp }).await.map_err(|_| ModelError::Failed("batcher stopped".into()))?;
        rx.await.map_err(|_| ModelError::Failed("batch dropped the request".into()))?
    }
}

async fn run_batch(reqs: Vec<BatchRequest>) {
    // a reload can land mid-window; never mix two models in one call
    let mut groups: BTreeMap<String, Vec<BatchRequest>> = BTreeMap::new();
    for r in reqs { groups.entry(r.model.run_id.clone()).or_default().push(r); }
    for (run_id, group) in groups {
        let model = group[0].model.model.clone();
        let inputs: Vec<ForecastInput> = group.iter().map(|r| r.input.clone()).collect();
        match invoke(model.clone(), inputs).await {
            Ok(outputs) => {
                for (r, out) in group.into_iter().zip(outputs) { let _ = r.resp.send(Ok(out)); }
            }
            Err(e) if group.len() == 1 => {
                if let Some(r) = group.into_iter().next() { let _ = r.resp.send(Err(e)); }
            }
            Err(e) => {
                warn!(%run_id, size = group.len(), error = %e, "batched call failed, retrying members one by one");
                for r in group {
                    let res = invoke_one(model.clone(), r.input).await;
                    let _ = r.resp.send(res);
                }
            }
        }
    }
}
