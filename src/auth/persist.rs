use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Durable storage for the token blob.
/// Implementations: FileBlobStore (one JSON file per node), MemoryBlobStore (tests, CLI dry runs).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the whole blob. `Ok(None)` when nothing was persisted yet.
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>>;

    /// Replace the whole blob.
    async fn save(&self, blob: &[u8]) -> anyhow::Result<()>;
}

/// Blob kept in a single file, replaced atomically through a temp file.
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    async fn save(&self, blob: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, blob)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory blob; `fail_writes` simulates a broken disk.
#[derive(Default)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<Vec<u8>>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
            fail_writes: Default::default(),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Option<Vec<u8>> {
        self.blob.lock().await.clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().await.clone())
    }

    async fn save(&self, blob: &[u8]) -> anyhow::Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        *self.blob.lock().await = Some(blob.to_vec());
        Ok(())
    }
}
