//! Storage backends
//!
//! One contract over local disk, the B2 native API and S3-compatible object
//! storage. Backends only talk to their remote; persisting upload state is
//! left to the [`UploadCoordinator`](crate::upload::UploadCoordinator).

pub mod b2;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chunks::FileChunk;
use crate::config::{Config, StorageKind};
use crate::metadata::{UploadSession, UploadTarget};

pub use b2::B2Backend;
pub use local::LocalBackend;
pub use s3::S3Backend;

/// Errors surfaced by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("remote ID cannot be empty")]
    EmptyRemoteId,

    #[error("exceeded maximum attempts")]
    ExceededMaximumAttempts,

    #[error("storage limit exceeded: {used} + {requested} bytes > {limit}")]
    LimitExceeded { used: u64, requested: u64, limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("B2 error: {0}")]
    B2(b2::B2Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Final state of an object after a single-shot upload or multipart commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub remote_id: String,
    pub length: u64,
}

/// Common contract implemented by every storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Establish or refresh credentials; safe to call repeatedly
    async fn authorize(&self) -> Result<(), StorageError>;

    /// Scheduled, best-effort reauthorization that never fails the caller
    async fn reauthorize(&self) {
        if let Err(e) = self.authorize().await {
            warn!(backend = ?self.kind(), error = %e, "Unable to reauthorize storage backend");
        } else {
            info!(backend = ?self.kind(), "Storage backend reauthorized");
        }
    }

    /// Allocate a single-shot upload target for a one-chunk object
    async fn init_upload(&self, file_id: &str) -> Result<UploadTarget, StorageError>;

    /// Allocate a multipart upload for `name`
    async fn init_large_upload(
        &self,
        name: &str,
        file_id: &str,
    ) -> Result<UploadTarget, StorageError>;

    /// Upload an object that fits in one chunk
    async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<RemoteObject, StorageError>;

    /// Upload one part of a multipart object and return its checksum
    ///
    /// The checksum is whatever [`finish_large_upload`](Self::finish_large_upload)
    /// expects for this part (SHA-1 for B2 and local, ETag for S3).
    async fn upload_part(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<String, StorageError>;

    /// Abort an in-progress multipart upload
    async fn cancel_large_file(&self, remote_id: &str, filename: &str)
        -> Result<bool, StorageError>;

    /// Delete a finished object; fails if `remote_id` is empty
    async fn delete_file(&self, remote_id: &str, filename: &str) -> Result<bool, StorageError>;

    /// Commit a multipart upload from checksums ordered by chunk index
    async fn finish_large_upload(
        &self,
        remote_id: &str,
        filename: &str,
        checksums: &[String],
    ) -> Result<RemoteObject, StorageError>;

    /// Fetch the inclusive byte range `start..=end`
    async fn partial_download_by_id(
        &self,
        remote_id: &str,
        filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StorageError>;
}

/// Build and authorize the backend selected by configuration
pub async fn connect(config: &Config) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.storage {
        StorageKind::Local => {
            info!(root = %config.local.root.display(), "Setting up local storage...");
            Arc::new(LocalBackend::new(config.local.clone()))
        }
        StorageKind::B2 => {
            let b2 = config
                .b2
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing B2 configuration"))?;
            info!("Authorizing B2 account...");
            Arc::new(B2Backend::new(b2)?)
        }
        StorageKind::S3 => {
            let s3 = config
                .s3
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing S3 configuration"))?;
            Arc::new(S3Backend::new(s3))
        }
    };

    backend.authorize().await?;
    Ok(backend)
}

/// Reject deletes with no remote object to act on
pub(crate) fn require_remote_id(remote_id: &str) -> Result<(), StorageError> {
    if remote_id.is_empty() {
        Err(StorageError::EmptyRemoteId)
    } else {
        Ok(())
    }
}
