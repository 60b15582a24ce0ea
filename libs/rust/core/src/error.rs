//! Error taxonomy shared by the promotion engine, the serving tier and the
//! autoscaler.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {container}/{key}")]
    NotFound { container: String, key: String },
    #[error("artifact store io error on {container}/{key}: {source}")]
    Io { container: String, key: String, #[source] source: std::io::Error },
    #[error("artifact {container}/{key} is not valid json: {source}")]
    Decode { container: String, key: String, #[source] source: serde_json::Error },
    #[error("invalid artifact key {0:?}")]
    InvalidKey(String),
    #[error("artifact store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Missing objects and malformed keys will not fix themselves on retry.
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Io { .. } | StoreError::Timeout(_)) }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run {0} not found in registry")]
    RunNotFound(String),
    #[error("no model artifact at handle {0}")]
    ArtifactNotFound(String),
    #[error("malformed model handle {0:?}")]
    InvalidHandle(String),
    #[error("registry backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for RegistryError { fn from(e: sled::Error) -> Self { RegistryError::Backend(e.to_string()) } }
impl From<serde_json::Error> for RegistryError { fn from(e: serde_json::Error) -> Self { RegistryError::Backend(format!("corrupt registry record: {e}")) } }

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model returned {got} outputs for {expected} inputs")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("window has {got} rows, model needs {needed}")]
    WindowTooShort { needed: usize, got: usize },
    #[error("target column {0:?} missing from window")]
    MissingTarget(String),
    #[error("model failure: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient candidates for {config_hash}: missing {missing:?} (received {received:?})")]
    InsufficientCandidates { config_hash: String, missing: Vec<String>, received: Vec<String> },
    #[error("invalid candidate set: {0}")]
    InvalidCandidates(String),
    #[error(transparent)]
    ArtifactStore(#[from] StoreError),
    #[error("failed to load model from {handles:?}: {reason}")]
    ModelLoad { handles: Vec<String>, reason: String },
    #[error("request queue overloaded ({occupancy}/{capacity}), retry later")]
    RequestOverloaded { occupancy: usize, capacity: usize },
    #[error("no model loaded yet")]
    ModelUnavailable,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ModelError> for ForecastError { fn from(e: ModelError) -> Self { ForecastError::Inference(e.to_string()) } }

impl ForecastError {
    /// Transient failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            ForecastError::ArtifactStore(e) => e.is_transient(),
            ForecastError::RequestOverloaded { .. } | ForecastError::ModelUnavailable | ForecastError::Timeout { .. } | ForecastError::ModelLoad { .. } => true,
            ForecastError::Registry(RegistryError::Backend(_)) => true,
            _ => false,
        }
    }

    /// Process exit code for one-shot runs.
    pub fn exit_code(&self) -> i32 {
        match self {
            ForecastError::InsufficientCandidates { .. } | ForecastError::InvalidCandidates(_) => 2,
            ForecastError::ArtifactStore(StoreError::NotFound { .. }) => 3,
            ForecastError::ModelLoad { .. } => 4,
            ForecastError::Config(_) => 5,
            _ => 1,
        }
    }
}
