// Read-only access to model artifacts and the version records that point at
// them. Both are external collaborators; the cache only sees these traits.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw artifact contents plus the identity the cache records for it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_hash: String, // blake3 hex digest of `bytes`
}

impl Artifact {
    pub fn new(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        Self {
            path: path.into(),
            bytes,
            content_hash,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Artifact>;
}

/// Artifacts on the local filesystem. With a root, every path is resolved
/// beneath it and may not climb out.
#[derive(Debug, Clone, Default)]
pub struct FsArtifactStore {
    root: Option<PathBuf>,
}

impl FsArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let requested = Path::new(path);
        match &self.root {
            None => Ok(requested.to_path_buf()),
            Some(root) => {
                if requested.is_absolute()
                    || requested
                        .components()
                        .any(|c| matches!(c, Component::ParentDir))
                {
                    bail!("artifact path '{path}' escapes the artifact root");
                }
                Ok(root.join(requested))
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn fetch(&self, path: &str) -> Result<Artifact> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .with_context(|| format!("failed to read artifact {}", resolved.display()))?;
        Ok(Artifact::new(path, bytes))
    }
}

/// What the relational store knows about one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionRecord {
    pub id: String,
    pub framework: String,
    pub artifact_path: String,
}

#[async_trait]
pub trait ModelVersionSource: Send + Sync {
    /// `Ok(None)` when no such version exists.
    async fn model_version(&self, id: &str) -> Result<Option<ModelVersionRecord>>;
}
