use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Content-addressed blob store for article images. Keys are lowercase hex
/// SHA-256 digests of the bytes.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// `Duplicate` when the hash is already stored; the bytes are not rewritten.
    async fn save(&self, hash: &str, bytes: &[u8]) -> Result<(), ImageStoreError>;
    /// Bytes plus sniffed MIME type.
    async fn load(&self, hash: &str) -> Result<(Vec<u8>, String), ImageStoreError>;
    async fn exists(&self, hash: &str) -> Result<bool, ImageStoreError>;
}

/// Anything else is rejected before it can reach a filesystem path.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- Filesystem implementation ----------------
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // two-level fan-out keeps directories small: <root>/ab/abcdef...
    fn path_for(&self, hash: &str) -> Result<PathBuf, ImageStoreError> {
        if !is_valid_hash(hash) {
            return Err(ImageStoreError::NotFound);
        }
        Ok(self.root.join(&hash[0..2]).join(hash))
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save(&self, hash: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        let path = self.path_for(hash).map_err(|_| ImageStoreError::Other(format!("invalid hash {hash:?}")))?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ImageStoreError::Duplicate);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ImageStoreError::Other(format!("create {}: {e}", dir.display())))?;
        }
        // write-then-rename so readers never see a partial file
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| ImageStoreError::Other(e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            warn!("image rename failed hash={hash}: {e}");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ImageStoreError::Other(e.to_string()));
        }
        Ok(())
    }

    async fn load(&self, hash: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        let path = self.path_for(hash)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ImageStoreError::NotFound),
            Err(e) => return Err(ImageStoreError::Other(e.to_string())),
        };
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn exists(&self, hash: &str) -> Result<bool, ImageStoreError> {
        let Ok(path) = self.path_for(hash) else { return Ok(false) };
        tokio::fs::try_exists(&path).await.map_err(|e| ImageStoreError::Other(e.to_string()))
    }
}

pub async fn build_image_store(root: &Path) -> anyhow::Result<Arc<dyn ImageStore>> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create image dir '{}': {e}", root.display()))?;
    info!(root = %root.display(), "filesystem image store ready");
    Ok(Arc::new(FsImageStore::new(root)))
}
