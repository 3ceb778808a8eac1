use crate::types::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Write seam for rendered digest documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store `content` under `key`, overwriting any previous document with
    /// the same key. Returns a locator for the stored document.
    async fn put_document(&self, key: &str, content: &str) -> Result<String>;
}

/// Filesystem-backed document store: one file per document under a root
/// directory, created on demand.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put_document(&self, key: &str, content: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(key);
        tokio::fs::write(&path, content).await?;
        info!("wrote document {}", path.display());
        Ok(path.display().to_string())
    }
}
