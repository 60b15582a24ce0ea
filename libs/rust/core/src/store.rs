//! Artifact store client: byte blobs addressed by `(container, key)`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::artifacts::ArtifactPointer;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create or overwrite one object. Overwrites are atomic per key.
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<ArtifactPointer, StoreError>;
    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    /// Add `bytes` to the end of an object, creating it when missing.
    async fn append(&self, container: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty() || key.starts_with('/') || key.contains('\\') || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad { Err(StoreError::InvalidKey(key.to_string())) } else { Ok(()) }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| StoreError::Timeout(limit))?
}

pub async fn put_json<T: Serialize + ?Sized>(store: &dyn ArtifactStore, container: &str, key: &str, value: &T, limit: Duration) -> Result<ArtifactPointer, StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Decode { container: container.into(), key: key.into(), source })?;
    bounded(limit, store.put(container, key, bytes)).await
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn ArtifactStore, container: &str, key: &str, limit: Duration) -> Result<T, StoreError> {
    let bytes = bounded(limit, store.get(container, key)).await?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode { container: container.into(), key: key.into(), source })
}

pub fn open_store(cfg: &StoreConfig) -> std::sync::Arc<dyn ArtifactStore> {
    match cfg.backend {
        StoreBackend::Fs => std::sync::Arc::new(FsStore::new(&cfg.root)),
        StoreBackend::Memory => std::sync::Arc::new(MemoryStore::new()),
    }
}

/// Process-local store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    failing_puts: AtomicUsize,
    failing_gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Make the next `n` puts fail with a transient io error.
    pub fn fail_next_puts(&self, n: usize) { self.failing_puts.store(n, Ordering::SeqCst); }
    pub fn fail_next_gets(&self, n: usize) { self.failing_gets.store(n, Ordering::SeqCst); }
    pub fn put_count(&self) -> usize { self.puts.load(Ordering::SeqCst) }

    pub fn keys(&self, container: &str) -> Vec<String> {
        self.objects.read().keys().filter(|(c, _)| c == container).map(|(_, k)| k.clone()).collect()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn injected(container: &str, key: &str) -> StoreError {
        StoreError::Io { container: container.into(), key: key.into(), source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure") }
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<ArtifactPointer, StoreError> {
        validate_key(key)?;
        if Self::take_failure(&self.failing_puts) { return Err(Self::injected(container, key)); }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.write().insert((container.to_string(), key.to_string()), bytes);
        Ok(ArtifactPointer::new(container, key))
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        if Self::take_failure(&self.failing_gets) { return Err(Self::injected(container, key)); }
        self.objects.read().get(&(container.to_string(), key.to_string())).cloned()
            .ok_or_else(|| StoreError::NotFound { container: container.into(), key: key.into() })
    }

    async fn append(&self, container: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        if Self::take_failure(&self.failing_puts) { return Err(Self::injected(container, key)); }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.write().entry((container.to_string(), key.to_string())).or_default().extend_from_slice(bytes);
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.keys(container).into_iter().filter(|k| k.starts_with(prefix)).collect())
    }
}

/// Directory-backed store: `{root}/{container}/{key}`.
pub struct FsStore { root: PathBuf }

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    fn path(&self, container: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(container)?;
        validate_key(key)?;
        Ok(self.root.join(container).join(key))
    }
}

fn io_err(container: &str, key: &str, source: std::io::Error) -> StoreError {
    if source.kind() == std::io::ErrorKind::NotFound { StoreError::NotFound { container: container.into(), key: key.into() } }
    else { StoreError::Io { container: container.into(), key: key.into(), source } }
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<ArtifactPointer, StoreError> {
        let path = self.path(container, key)?;
        if let Some(parent) = path.parent() { tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(container, key, e))?; }
        // write-then-rename so readers never see a torn pointer
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| io_err(container, key, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_err(container, key, e))?;
        Ok(ArtifactPointer::new(container, key))
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(container, key)?;
        tokio::fs::read(&path).await.map_err(|e| io_err(container, key, e))
    }

    async fn append(&self, container: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        use tokio::io::AsyncWriteExt;
        let path = self.path(container, key)?;
        if let Some(parent) = path.parent() { tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(container, key, e))?; }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await.map_err(|e| io_err(container, key, e))?;
        file.write_all(bytes).await.map_err(|e| io_err(container, key, e))?;
        file.flush().await.map_err(|e| io_err(container, key, e))
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        validate_key(container)?;
        let base = self.root.join(container);
        let mut out = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(container, prefix, e)),
            };
            while let Some(entry) = rd.next_entry().await.map_err(|e| io_err(container, prefix, e))? {
                let p = entry.path();
                let ft = entry.file_type().await.map_err(|e| io_err(container, prefix, e))?;
                if ft.is_dir() { stack.push(p); continue; }
                if let Some(key) = relative_key(&base, &p) { if key.starts_with(prefix) && !key.contains(".tmp-") { out.push(key); } }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    Some(parts.join("/"))
}
