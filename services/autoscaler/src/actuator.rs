use async_trait::async_trait;
use forecast_core::ScalingState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("state file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("state file {path} is not valid json: {source}")]
    Decode { path: String, #[source] source: serde_json::Error },
}

/// Where replica decisions go and where the last one is read back from.
#[async_trait]
pub trait ReplicaSink: Send + Sync {
    async fn load(&self) -> Result<Option<ScalingState>, SinkError>;
    async fn apply(&self, state: &ScalingState) -> Result<(), SinkError>;
}

/// JSON state file watched by the deployment platform.
pub struct StateFileSink { path: PathBuf }

impl StateFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn io(&self, source: std::io::Error) -> SinkError { SinkError::Io { path: self.path.display().to_string(), source } }
}

#[async_trait]
impl ReplicaSink for StateFileSink {
    async fn load(&self) -> Result<Option<ScalingState>, SinkError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io(e)),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|source| SinkError::Decode { path: self.path.display().to_string(), source })
    }

    async fn apply(&self, state: &ScalingState) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io(e))?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| SinkError::Decode { path: self.path.display().to_string(), source })?;
        // the platform may read at any moment
        let tmp = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await.map_err(|e| self.io(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn missing_file_then_round_trip() {
        let path = std::env::temp_dir().join(format!("scaling-{}", uuid::Uuid::new_v4().simple())).join("state.json");
        let sink = StateFileSink::new(&path);
        assert!(sink.load().await.unwrap().is_none());
        let state = ScalingState { current_replicas: 2, desired_replicas: 4, last_scale_up_time: Some(Utc::now()), last_scale_down_time: None };
        sink.apply(&state).await.unwrap();
        assert_eq!(sink.load().await.unwrap(), Some(state));
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let path = std::env::temp_dir().join(format!("scaling-{}.json", uuid::Uuid::new_v4().simple()));
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(StateFileSink::new(&path).load().await, Err(SinkError::Decode { .. })));
        let _ = std::fs::remove_file(path);
    }
}
