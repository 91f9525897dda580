//! Artifact store gateway.
//!
//! Blobs are immutable once written. Every `put` issues a fresh key under
//! the requested namespace, and every `get` re-hashes the bytes against the
//! digest recorded in the [`ArtifactRef`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use imgfleet_core::{ArtifactRef, content_digest};

use crate::GatewayFuture;
use crate::error::{GatewayError, GatewayResult};
use crate::faults::Faults;

pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under a new key in `namespace` (e.g. `inputs`).
    fn put<'a>(&'a self, namespace: &'a str, bytes: Bytes) -> GatewayFuture<'a, ArtifactRef>;

    /// Fetch and verify a blob.
    fn get<'a>(&'a self, artifact: &'a ArtifactRef) -> GatewayFuture<'a, Bytes>;
}

fn fresh_key(namespace: &str) -> String {
    format!("{namespace}/{}", uuid::Uuid::new_v4().simple())
}

fn verify(artifact: &ArtifactRef, bytes: &[u8]) -> GatewayResult<()> {
    let actual = content_digest(bytes);
    if actual != artifact.sha256 {
        return Err(GatewayError::Corrupt {
            key: artifact.key.clone(),
            expected: artifact.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

// ── Memory ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    faults: Faults,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a stored blob in place, bypassing immutability.
    #[cfg(test)]
    pub(crate) async fn tamper(&self, key: &str, bytes: Bytes) {
        self.blobs.write().await.insert(key.to_string(), bytes);
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put<'a>(&'a self, namespace: &'a str, bytes: Bytes) -> GatewayFuture<'a, ArtifactRef> {
        Box::pin(async move {
            self.faults.check("artifact store")?;
            let artifact = ArtifactRef {
                key: fresh_key(namespace),
                sha256: content_digest(&bytes),
            };
            self.blobs.write().await.insert(artifact.key.clone(), bytes);
            debug!(%artifact, "artifact stored");
            Ok(artifact)
        })
    }

    fn get<'a>(&'a self, artifact: &'a ArtifactRef) -> GatewayFuture<'a, Bytes> {
        Box::pin(async move {
            self.faults.check("artifact store")?;
            let bytes = self
                .blobs
                .read()
                .await
                .get(&artifact.key)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(artifact.key.clone()))?;
            verify(artifact, &bytes)?;
            Ok(bytes)
        })
    }
}

// ── Filesystem ────────────────────────────────────────────────────

/// Blobs stored as plain files under a root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> GatewayResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "artifact directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that escapes the root.
    fn path_for(&self, key: &str) -> GatewayResult<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(GatewayError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put<'a>(&'a self, namespace: &'a str, bytes: Bytes) -> GatewayFuture<'a, ArtifactRef> {
        Box::pin(async move {
            let artifact = ArtifactRef {
                key: fresh_key(namespace),
                sha256: content_digest(&bytes),
            };
            let path = self.path_for(&artifact.key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write then rename, so readers never observe a partial blob.
            let staging = path.with_extension("partial");
            tokio::fs::write(&staging, &bytes).await?;
            tokio::fs::rename(&staging, &path).await?;
            debug!(%artifact, size = bytes.len(), "artifact written");
            Ok(artifact)
        })
    }

    fn get<'a>(&'a self, artifact: &'a ArtifactRef) -> GatewayFuture<'a, Bytes> {
        Box::pin(async move {
            let path = self.path_for(&artifact.key)?;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(GatewayError::NotFound(artifact.key.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            verify(artifact, &bytes)?;
            Ok(bytes)
        })
    }
}
