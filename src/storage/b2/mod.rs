//! Backblaze B2 storage backend

pub mod client;
pub mod errors;
pub mod types;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use client::B2Client;
pub use errors::B2Error;

use super::{require_remote_id, RemoteObject, StorageBackend, StorageError};
use crate::chunks::{sha1_hex, FileChunk};
use crate::config::{B2Config, StorageKind};
use crate::metadata::{UploadSession, UploadTarget};

/// [`StorageBackend`] over the B2 native API
pub struct B2Backend {
    client: B2Client,
}

impl B2Backend {
    /// Create an unauthorized backend; [`StorageBackend::authorize`] must run first
    pub fn new(config: B2Config) -> Result<Self, StorageError> {
        let client = B2Client::new(&config.key_id, &config.key, &config.bucket_id)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StorageBackend for B2Backend {
    fn kind(&self) -> StorageKind {
        StorageKind::B2
    }

    async fn authorize(&self) -> Result<(), StorageError> {
        self.client.authorize().await?;
        Ok(())
    }

    async fn init_upload(&self, _file_id: &str) -> Result<UploadTarget, StorageError> {
        let url = self.client.get_upload_url().await?;
        Ok(UploadTarget {
            upload_url: url.upload_url,
            token: url.authorization_token,
            // Single chunk files use the bucket ID for uploading
            upload_id: url
                .bucket_id
                .unwrap_or_else(|| self.client.bucket_id().to_string()),
            local: false,
        })
    }

    async fn init_large_upload(
        &self,
        name: &str,
        _file_id: &str,
    ) -> Result<UploadTarget, StorageError> {
        let large = self.client.start_large_file(name).await?;
        let part_url = self.client.get_upload_part_url(&large.file_id).await?;
        Ok(UploadTarget {
            upload_url: part_url.upload_url,
            token: part_url.authorization_token,
            // Multi-chunk files use the large file ID for uploading
            upload_id: large.file_id,
            local: false,
        })
    }

    async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<RemoteObject, StorageError> {
        let target = &session.target;
        let result = if target.upload_url.is_empty() {
            Err(B2Error::Unauthorized)
        } else {
            self.client
                .upload_file(&target.upload_url, &target.token, &chunk.filename, &chunk.data)
                .await
        };

        // Upload URLs go stale; a failed attempt retries once on a fresh one
        let file = match result {
            Ok(file) => file,
            Err(e) if e.is_retryable() || matches!(e, B2Error::Unauthorized) => {
                warn!(file_id = %chunk.file_id, error = %e, "Retrying B2 upload with a new upload URL");
                let url = self.client.get_upload_url().await?;
                self.client
                    .upload_file(
                        &url.upload_url,
                        &url.authorization_token,
                        &chunk.filename,
                        &chunk.data,
                    )
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(RemoteObject {
            remote_id: file.file_id,
            length: file.content_length,
        })
    }

    async fn upload_part(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<String, StorageError> {
        let checksum = sha1_hex(&chunk.data);
        let part_url = self
            .client
            .get_upload_part_url(&session.target.upload_id)
            .await?;
        debug!(
            file_id = %chunk.file_id,
            chunk = chunk.chunk_num,
            url = %part_url.upload_url,
            "Uploading chunk to B2"
        );

        let part = self
            .client
            .upload_part(&part_url, chunk.chunk_num, &checksum, &chunk.data)
            .await?;
        Ok(part.content_sha1)
    }

    async fn cancel_large_file(
        &self,
        remote_id: &str,
        _filename: &str,
    ) -> Result<bool, StorageError> {
        if remote_id.is_empty() {
            return Ok(false);
        }
        self.client.cancel_large_file(remote_id).await?;
        Ok(true)
    }

    async fn delete_file(&self, remote_id: &str, filename: &str) -> Result<bool, StorageError> {
        require_remote_id(remote_id)?;
        self.client.delete_file_version(filename, remote_id).await?;
        Ok(true)
    }

    async fn finish_large_upload(
        &self,
        remote_id: &str,
        _filename: &str,
        checksums: &[String],
    ) -> Result<RemoteObject, StorageError> {
        let file = self.client.finish_large_file(remote_id, checksums).await?;
        Ok(RemoteObject {
            remote_id: file.file_id,
            length: file.content_length,
        })
    }

    async fn partial_download_by_id(
        &self,
        remote_id: &str,
        _filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StorageError> {
        Ok(self.client.download_file_by_id(remote_id, start, end).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> B2Backend {
        B2Backend::new(B2Config {
            bucket_id: "bucket".to_string(),
            key_id: "key-id".to_string(),
            key: "key".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_delete_with_empty_remote_id_fails_without_request() {
        let result = backend().delete_file("", "name").await;
        assert!(matches!(result, Err(StorageError::EmptyRemoteId)));
    }

    #[tokio::test]
    async fn test_cancel_with_empty_remote_id_is_noop() {
        assert!(!backend().cancel_large_file("", "name").await.unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_calls_fail() {
        let b2 = backend();
        assert_eq!(b2.kind(), StorageKind::B2);
        let result = b2.partial_download_by_id("4_z", "name", 0, 10).await;
        assert!(matches!(
            result,
            Err(StorageError::B2(B2Error::Unauthorized))
        ));
    }
}
