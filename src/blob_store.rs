use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob not found")]
    NotFound,
    #[error("invalid blob reference")]
    InvalidRef,
}

/// Content-addressed blob storage capability. References are the SHA-256
/// hex digest of the content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;
    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn valid_ref(blob_ref: &str) -> bool {
    blob_ref.len() == 64 && blob_ref.chars().all(|c| c.is_ascii_hexdigit())
}

/// Filesystem implementation sharded by the first two hash characters.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, blob_ref: &str) -> PathBuf {
        self.root.join(&blob_ref[..2]).join(&blob_ref[2..])
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let blob_ref = content_hash(bytes);
        let path = self.path_for(&blob_ref);
        if fs::metadata(&path).await.is_ok() {
            // Same hash, same content.
            return Ok(blob_ref);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError> {
        if !valid_ref(blob_ref) {
            return Err(BlobError::InvalidRef);
        }
        match fs::read(self.path_for(blob_ref)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

impl std::fmt::Debug for FsBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBlobStore")
            .field("root", &self.root.display())
            .finish()
    }
}
