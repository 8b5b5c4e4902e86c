//! S3-compatible storage backend
//!
//! Objects are keyed by their object name (`<file_id>/<name>`) with
//! path-style addressing, so any S3-compatible endpoint (R2, MinIO, Wasabi,
//! ...) works. The key doubles as the remote ID.

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::{debug, error, info};

use super::{require_remote_id, RemoteObject, StorageBackend, StorageError};
use crate::chunks::FileChunk;
use crate::config::{S3Config, StorageKind};
use crate::metadata::{UploadSession, UploadTarget};

const TEST_FILE_NAME: &str = "test-connection";
const TEST_FILE_CONTENT: &[u8] = b"test";
const CONTENT_TYPE: &str = "application/octet-stream";

/// [`StorageBackend`] over the S3 API
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Self {
        let creds = Credentials::new(
            &config.access_key_id,
            &config.secret_key,
            None,
            None,
            "chunkstore-env",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket_name,
        }
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("upload object", e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    /// Verify credentials and bucket access by writing a small test object
    async fn authorize(&self) -> Result<(), StorageError> {
        info!(bucket = %self.bucket, "Authorizing S3 backend...");
        self.put_object(TEST_FILE_NAME, TEST_FILE_CONTENT.to_vec())
            .await
    }

    /// Static credentials never expire
    async fn reauthorize(&self) {}

    async fn init_upload(&self, _file_id: &str) -> Result<UploadTarget, StorageError> {
        // Single-chunk uploads go straight to PutObject
        Ok(UploadTarget::default())
    }

    async fn init_large_upload(
        &self,
        name: &str,
        _file_id: &str,
    ) -> Result<UploadTarget, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| s3_error("initiate multipart upload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("multipart upload response missing upload ID"))?;
        debug!(key = name, upload_id = upload_id, "Started S3 multipart upload");

        Ok(UploadTarget {
            upload_id: upload_id.to_string(),
            ..Default::default()
        })
    }

    async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        _session: &UploadSession,
    ) -> Result<RemoteObject, StorageError> {
        self.put_object(&chunk.filename, chunk.data.clone()).await?;
        Ok(RemoteObject {
            remote_id: chunk.filename.clone(),
            length: chunk.data.len() as u64,
        })
    }

    async fn upload_part(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<String, StorageError> {
        let part_number = part_number(chunk.chunk_num)?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&chunk.filename)
            .upload_id(&session.target.upload_id)
            .part_number(part_number)
            .content_length(chunk.data.len() as i64)
            .body(ByteStream::from(chunk.data.clone()))
            .send()
            .await
            .map_err(|e| s3_error("upload file chunk", e))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| anyhow::anyhow!("part {} response missing ETag", part_number))?;
        Ok(etag.to_string())
    }

    async fn cancel_large_file(
        &self,
        remote_id: &str,
        filename: &str,
    ) -> Result<bool, StorageError> {
        if remote_id.is_empty() {
            return Ok(false);
        }
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(filename)
            .upload_id(remote_id)
            .send()
            .await
            .map_err(|e| s3_error("abort multipart upload", e))?;
        info!(key = filename, "Aborted S3 multipart upload");
        Ok(true)
    }

    async fn delete_file(&self, remote_id: &str, filename: &str) -> Result<bool, StorageError> {
        require_remote_id(remote_id)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(filename)
            .send()
            .await
            .map_err(|e| s3_error("delete file", e))?;
        Ok(true)
    }

    async fn finish_large_upload(
        &self,
        remote_id: &str,
        filename: &str,
        checksums: &[String],
    ) -> Result<RemoteObject, StorageError> {
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts(checksums)?))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(filename)
            .upload_id(remote_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| s3_error("finalize multipart upload", e))?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(filename)
            .send()
            .await
            .map_err(|e| s3_error("read object length", e))?;
        let length = head.content_length().unwrap_or_default().max(0) as u64;

        info!(key = filename, parts = checksums.len(), size = length, "Finished S3 multipart upload");
        Ok(RemoteObject {
            remote_id: filename.to_string(),
            length,
        })
    }

    async fn partial_download_by_id(
        &self,
        _remote_id: &str,
        filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(filename)
            .range(byte_range(start, end))
            .send()
            .await
            .map_err(|e| s3_error("fetch object bytes", e))?;

        let data = output
            .body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes();
        Ok(data.to_vec())
    }
}

fn s3_error<E: std::error::Error>(operation: &str, e: E) -> StorageError {
    let message = format!("Failed to {}: {}", operation, DisplayErrorContext(&e));
    error!("{}", message);
    StorageError::Other(anyhow::anyhow!(message))
}

fn part_number(chunk_num: u64) -> Result<i32, StorageError> {
    i32::try_from(chunk_num)
        .map_err(|_| anyhow::anyhow!("part number {} out of range", chunk_num).into())
}

/// Parts for CompleteMultipartUpload, numbered 1..N in checksum order
fn completed_parts(checksums: &[String]) -> Result<Vec<CompletedPart>, StorageError> {
    checksums
        .iter()
        .enumerate()
        .map(|(i, etag)| {
            Ok(CompletedPart::builder()
                .e_tag(etag)
                .part_number(part_number(i as u64 + 1)?)
                .build())
        })
        .collect()
}

fn byte_range(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> S3Backend {
        S3Backend::new(S3Config {
            endpoint: "https://s3.example.com".to_string(),
            access_key_id: "access".to_string(),
            secret_key: "secret".to_string(),
            bucket_name: "bucket".to_string(),
            region: "auto".to_string(),
        })
    }

    #[test]
    fn test_completed_parts_numbered_from_one() {
        let checksums = vec!["\"etag-1\"".to_string(), "\"etag-2\"".to_string()];
        let parts = completed_parts(&checksums).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number(), Some(1));
        assert_eq!(parts[0].e_tag(), Some("\"etag-1\""));
        assert_eq!(parts[1].part_number(), Some(2));
    }

    #[test]
    fn test_part_number_bounds() {
        assert_eq!(part_number(3).unwrap(), 3);
        assert!(part_number(u64::MAX).is_err());
    }

    #[test]
    fn test_byte_range() {
        assert_eq!(byte_range(10_000_028, 12_000_055), "bytes=10000028-12000055");
    }

    #[tokio::test]
    async fn test_delete_with_empty_remote_id_fails_without_request() {
        let s3 = backend();
        assert_eq!(s3.kind(), StorageKind::S3);
        assert!(matches!(
            s3.delete_file("", "name").await,
            Err(StorageError::EmptyRemoteId)
        ));
        assert!(!s3.cancel_large_file("", "name").await.unwrap());
    }
}
