//! Upload coordination
//!
//! Drives one file through `Initialized -> Uploading -> Finalizing -> Complete`.
//! Chunks may arrive in any order; checksums are stored by chunk index and the
//! multipart commit runs once, when every slot is filled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chunks::{sha1_hex, FileChunk};
use crate::error::TransferError;
use crate::metadata::{completed_checksums, FileObject, MetadataStore, UploadSession, UploadState};
use crate::storage::{StorageBackend, StorageError};

/// Total attempts allowed for one chunk upload
pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;

/// How failed chunk uploads are retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before each retry, doubled every attempt
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_UPLOAD_ATTEMPTS,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, as fast as the backend allows
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
    }
}

/// Coordinates chunk uploads between a backend and the metadata store
pub struct UploadCoordinator {
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl UploadCoordinator {
    pub fn new(backend: Arc<dyn StorageBackend>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            backend,
            metadata,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open an upload session and allocate its backend target
    ///
    /// Single-chunk files get a single-shot target, anything larger a
    /// multipart upload.
    pub async fn init(&self, file: &FileObject) -> Result<(), TransferError> {
        let object_name = file.object_name();
        self.metadata.create_upload(&file.id, &object_name).await?;

        let target = if file.chunks <= 1 {
            self.backend.init_upload(&file.id).await?
        } else {
            self.backend.init_large_upload(&object_name, &file.id).await?
        };
        self.metadata.update_upload_values(&file.id, &target).await?;
        self.metadata
            .transition_upload(&file.id, UploadState::Initialized, UploadState::Uploading)
            .await?;

        info!(
            file_id = %file.id,
            chunks = file.chunks,
            multipart = file.chunks > 1,
            "Upload initialized"
        );
        Ok(())
    }

    /// Upload one chunk and report whether the file is now complete
    pub async fn upload_chunk(&self, chunk: &FileChunk) -> Result<bool, TransferError> {
        let session = self.metadata.get_upload(&chunk.file_id).await?;
        let total = session.checksums.len() as u64;
        if chunk.chunk_num == 0 || chunk.chunk_num > total {
            return Err(TransferError::InvalidChunk {
                chunk: chunk.chunk_num,
                total,
            });
        }

        if session.state == UploadState::Complete {
            debug!(file_id = %chunk.file_id, chunk = chunk.chunk_num, "Chunk for completed upload ignored");
            return Ok(true);
        }

        if total == 1 {
            self.upload_single_chunk(chunk, &session).await
        } else {
            self.upload_multi_chunk(chunk, &session).await
        }
    }

    /// Upload a whole one-chunk object and record its remote ID and length
    pub async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<bool, TransferError> {
        let remote = self
            .with_retry(chunk, || self.backend.upload_single_chunk(chunk, session))
            .await?;

        self.metadata
            .update_checksum(&chunk.file_id, chunk.chunk_num, &sha1_hex(&chunk.data))
            .await?;
        self.metadata
            .update_metadata(&chunk.file_id, &remote.remote_id, remote.length)
            .await?;
        self.metadata
            .transition_upload(&chunk.file_id, UploadState::Uploading, UploadState::Complete)
            .await?;

        info!(file_id = %chunk.file_id, size = remote.length, "Single chunk upload complete");
        Ok(true)
    }

    /// Upload one part; commit the object once all parts are recorded
    pub async fn upload_multi_chunk(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<bool, TransferError> {
        let checksum = self
            .with_retry(chunk, || self.backend.upload_part(chunk, session))
            .await?;

        let slots = self
            .metadata
            .update_checksum(&chunk.file_id, chunk.chunk_num, &checksum)
            .await?;
        let checksums = match completed_checksums(&slots, session.checksums.len() as u64) {
            Some(checksums) => checksums,
            None => {
                debug!(
                    file_id = %chunk.file_id,
                    chunk = chunk.chunk_num,
                    received = slots.iter().flatten().count(),
                    total = slots.len(),
                    "Chunk recorded"
                );
                return Ok(false);
            }
        };

        // Exactly one caller wins the right to finalize
        let finalizing = self
            .metadata
            .transition_upload(&chunk.file_id, UploadState::Uploading, UploadState::Finalizing)
            .await?;
        if !finalizing {
            let state = self.metadata.get_upload(&chunk.file_id).await?.state;
            return Ok(state == UploadState::Complete);
        }

        let remote = match self
            .backend
            .finish_large_upload(&session.target.upload_id, &session.name, &checksums)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(file_id = %chunk.file_id, error = %e, "Failed to finish multipart upload");
                self.metadata
                    .transition_upload(
                        &chunk.file_id,
                        UploadState::Finalizing,
                        UploadState::Uploading,
                    )
                    .await?;
                return Err(e.into());
            }
        };

        self.metadata
            .update_metadata(&chunk.file_id, &remote.remote_id, remote.length)
            .await?;
        self.metadata
            .transition_upload(&chunk.file_id, UploadState::Finalizing, UploadState::Complete)
            .await?;

        info!(
            file_id = %chunk.file_id,
            parts = checksums.len(),
            size = remote.length,
            "Multipart upload complete"
        );
        Ok(true)
    }

    async fn with_retry<T, F, Fut>(&self, chunk: &FileChunk, f: F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        file_id = %chunk.file_id,
                        chunk = chunk.chunk_num,
                        attempt = attempt,
                        max = self.retry.max_attempts,
                        error = %e,
                        "Retrying chunk upload"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        file_id = %chunk.file_id,
                        chunk = chunk.chunk_num,
                        error = %e,
                        "Chunk upload failed on final attempt"
                    );
                    return Err(StorageError::ExceededMaximumAttempts.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::{ChunkLayout, CHUNK_SIZE, TOTAL_OVERHEAD};
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::mock::MockBackend;
    use std::sync::atomic::Ordering;

    struct Fixture {
        backend: Arc<MockBackend>,
        metadata: Arc<MemoryMetadataStore>,
        coordinator: UploadCoordinator,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let coordinator = UploadCoordinator::new(backend.clone(), metadata.clone())
            .with_retry_policy(RetryPolicy::immediate(MAX_UPLOAD_ATTEMPTS));
        Fixture {
            backend,
            metadata,
            coordinator,
        }
    }

    async fn start(f: &Fixture, id: &str, length: u64, chunks: u64) -> FileObject {
        let file = FileObject::new(id, format!("{}.bin", id), length, chunks);
        f.metadata.create_file(file.clone()).await.unwrap();
        f.coordinator.init(&file).await.unwrap();
        file
    }

    fn chunk(file: &FileObject, num: u64, data: Vec<u8>) -> FileChunk {
        FileChunk {
            file_id: file.id.clone(),
            filename: file.object_name(),
            data,
            chunk_num: num,
            total_chunks: file.chunks,
        }
    }

    #[tokio::test]
    async fn test_single_chunk_upload() {
        let f = fixture();
        let file = start(&f, "one", 5, 1).await;

        assert!(f.coordinator.upload_chunk(&chunk(&file, 1, b"hello".to_vec())).await.unwrap());

        let stored = f.metadata.get_file("one").await.unwrap();
        assert!(!stored.remote_id.is_empty());
        assert_eq!(stored.length, 5);
        let session = f.metadata.get_upload("one").await.unwrap();
        assert_eq!(session.state, UploadState::Complete);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_finish_in_index_order() {
        let f = fixture();
        let file = start(&f, "two", 8, 2).await;

        assert!(!f.coordinator.upload_chunk(&chunk(&file, 2, b"efgh".to_vec())).await.unwrap());
        assert!(f.backend.finish_calls.lock().unwrap().is_empty());
        assert!(f.coordinator.upload_chunk(&chunk(&file, 1, b"abcd".to_vec())).await.unwrap());

        let finish_calls = f.backend.finish_calls.lock().unwrap().clone();
        assert_eq!(
            finish_calls,
            vec![vec![sha1_hex(b"abcd"), sha1_hex(b"efgh")]]
        );

        let stored = f.metadata.get_file("two").await.unwrap();
        let objects = f.backend.objects.lock().unwrap();
        assert_eq!(objects[&stored.remote_id], b"abcdefgh");
    }

    #[tokio::test]
    async fn test_duplicate_final_chunk_finalizes_once() {
        let f = fixture();
        let file = start(&f, "dup", 8, 2).await;
        f.coordinator.upload_chunk(&chunk(&file, 1, b"abcd".to_vec())).await.unwrap();
        assert!(f.coordinator.upload_chunk(&chunk(&file, 2, b"efgh".to_vec())).await.unwrap());
        assert!(f.coordinator.upload_chunk(&chunk(&file, 2, b"efgh".to_vec())).await.unwrap());
        assert_eq!(f.backend.finish_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_index_validation() {
        let f = fixture();
        let file = start(&f, "bad", 8, 2).await;
        for num in [0, 3] {
            let result = f.coordinator.upload_chunk(&chunk(&file, num, vec![1])).await;
            assert!(matches!(
                result,
                Err(TransferError::InvalidChunk { total: 2, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture();
        let file = start(&f, "flaky", 8, 2).await;
        f.backend.fail_chunk(1, MAX_UPLOAD_ATTEMPTS as usize - 1);

        let done = f.coordinator.upload_chunk(&chunk(&file, 1, b"abcd".to_vec())).await.unwrap();
        assert!(!done);
        assert_eq!(
            f.backend.part_attempts.load(Ordering::SeqCst),
            MAX_UPLOAD_ATTEMPTS as usize
        );
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let f = fixture();
        let file = start(&f, "broken", 8, 2).await;
        f.backend.fail_chunk(1, MAX_UPLOAD_ATTEMPTS as usize);

        let err = f
            .coordinator
            .upload_chunk(&chunk(&file, 1, b"abcd".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(
            f.backend.part_attempts.load(Ordering::SeqCst),
            MAX_UPLOAD_ATTEMPTS as usize
        );

        // The session stays retryable
        let session = f.metadata.get_upload("broken").await.unwrap();
        assert_eq!(session.state, UploadState::Uploading);
        assert_eq!(session.received(), 0);
        assert!(!f.coordinator.upload_chunk(&chunk(&file, 1, b"abcd".to_vec())).await.unwrap());
    }

    #[tokio::test]
    async fn test_twelve_megabyte_round_trip() {
        let f = fixture();
        let layout = ChunkLayout::default();
        let plaintext_len = 12_000_000;
        let stored_len = layout.stored_len(plaintext_len);
        assert_eq!(layout.num_chunks(plaintext_len), 2);

        let ciphertext: Vec<u8> = (0..stored_len).map(|i| (i % 251) as u8).collect();
        let first = (CHUNK_SIZE + TOTAL_OVERHEAD) as usize;
        let file = start(&f, "big", stored_len, 2).await;

        let c1 = chunk(&file, 1, ciphertext[..first].to_vec());
        let c2 = chunk(&file, 2, ciphertext[first..].to_vec());
        assert_eq!(c1.data.len(), 10_000_028);
        assert_eq!(c2.data.len(), 2_000_028);
        assert!(!f.coordinator.upload_chunk(&c1).await.unwrap());
        assert!(f.coordinator.upload_chunk(&c2).await.unwrap());

        let stored = f.metadata.get_file("big").await.unwrap();
        assert_eq!(stored.length, stored_len);

        let mut downloaded = Vec::new();
        for i in 1..=2 {
            let range = layout.read_boundaries(i, stored.length).unwrap();
            let bytes = f
                .backend
                .partial_download_by_id(&stored.remote_id, &stored.object_name(), range.start, range.end)
                .await
                .unwrap();
            assert_eq!(range.eof, i == 2);
            downloaded.extend(bytes);
        }
        assert!(downloaded == ciphertext);
    }
}
