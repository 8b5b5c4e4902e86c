//! Transfer orchestration
//!
//! Ties the upload coordinator, storage backend, metadata store and disk
//! cache together into the operations a request handler or the CLI calls.
//! Cache problems are logged and never surface to the caller.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::DiskCache;
use crate::chunks::{ChunkLayout, FileChunk, ReadRange};
use crate::error::TransferError;
use crate::metadata::{FileObject, MetadataError, MetadataStore, UploadState};
use crate::storage::StorageBackend;
use crate::upload::{RetryPolicy, UploadCoordinator};

/// One downloaded chunk of stored bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedChunk {
    pub data: Vec<u8>,
    /// This chunk ends the object
    pub eof: bool,
}

pub struct TransferService {
    coordinator: UploadCoordinator,
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<DiskCache>,
    layout: ChunkLayout,
}

impl TransferService {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        cache: DiskCache,
    ) -> Self {
        Self {
            coordinator: UploadCoordinator::new(backend.clone(), metadata.clone()),
            backend,
            metadata,
            cache: Arc::new(cache),
            layout: ChunkLayout::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.coordinator = self.coordinator.with_retry_policy(retry);
        self
    }

    pub fn with_layout(mut self, layout: ChunkLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Register a new file and open its upload; returns the new file ID
    ///
    /// `length` is the stored (encrypted) length, and `chunks` must be the
    /// number of chunks it splits into.
    pub async fn init_upload(
        &self,
        name: &str,
        length: u64,
        chunks: u64,
    ) -> Result<String, TransferError> {
        let expected = self.layout.num_chunks_stored(length);
        if chunks == 0 || chunks != expected {
            return Err(TransferError::ChunkCountMismatch {
                length,
                chunks,
                expected,
            });
        }

        let file = FileObject::new(Uuid::new_v4().to_string(), name, length, chunks);
        self.metadata.create_file(file.clone()).await?;

        if let Err(e) = self.coordinator.init(&file).await {
            warn!(file_id = %file.id, error = %e, "Upload initialization failed");
            self.metadata.clear(&file.id).await?;
            return Err(e);
        }
        Ok(file.id)
    }

    /// Upload chunk `chunk_num` (1-based); returns true once the file is complete
    ///
    /// An out-of-range chunk index aborts the upload. Other failures leave
    /// the session in place so the chunk can be retried or the upload
    /// explicitly [aborted](Self::abort_upload).
    pub async fn upload_chunk(
        &self,
        file_id: &str,
        chunk_num: u64,
        data: Vec<u8>,
    ) -> Result<bool, TransferError> {
        let file = self.metadata.get_file(file_id).await?;
        if chunk_num == 0 || chunk_num > file.chunks {
            warn!(file_id = file_id, chunk = chunk_num, total = file.chunks, "Invalid chunk index, aborting upload");
            self.abort_upload(file_id).await?;
            return Err(TransferError::InvalidChunk {
                chunk: chunk_num,
                total: file.chunks,
            });
        }

        let chunk = FileChunk {
            filename: file.object_name(),
            file_id: file.id,
            data,
            chunk_num,
            total_chunks: file.chunks,
        };
        self.coordinator.upload_chunk(&chunk).await
    }

    /// Cancel any remote multipart upload and forget the file
    pub async fn abort_upload(&self, file_id: &str) -> Result<(), TransferError> {
        let file = self.metadata.get_file(file_id).await?;
        match self.metadata.get_upload(file_id).await {
            Ok(session) if file.chunks > 1 && session.state != UploadState::Complete => {
                match self
                    .backend
                    .cancel_large_file(&session.target.upload_id, &file.object_name())
                    .await
                {
                    Ok(cancelled) => {
                        debug!(file_id = file_id, cancelled = cancelled, "Cancelled multipart upload")
                    }
                    Err(e) => warn!(file_id = file_id, error = %e, "Failed to cancel multipart upload"),
                }
            }
            Ok(_) | Err(MetadataError::UploadNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.remove_cached(file_id).await;
        self.metadata.clear(file_id).await?;
        info!(file_id = file_id, "Upload aborted");
        Ok(())
    }

    pub async fn file_info(&self, file_id: &str) -> Result<FileObject, TransferError> {
        Ok(self.metadata.get_file(file_id).await?)
    }

    /// Fetch one stored chunk, preferring the disk cache
    ///
    /// Chunk 0 is treated as chunk 1.
    pub async fn download_chunk(
        &self,
        file_id: &str,
        chunk: u64,
    ) -> Result<DownloadedChunk, TransferError> {
        let file = self.metadata.get_file(file_id).await?;
        if file.remote_id.is_empty() {
            return Err(TransferError::NotUploaded(file.id));
        }
        let range = self
            .layout
            .read_boundaries(chunk, file.length)
            .ok_or(TransferError::InvalidChunk {
                chunk,
                total: file.chunks,
            })?;

        if let Some(data) = self.read_cached(&file, range).await {
            return Ok(DownloadedChunk {
                data,
                eof: range.eof,
            });
        }

        if range.start == 0 {
            let (id, length) = (file.id.clone(), file.length);
            self.with_cache(move |cache| cache.prep_cache(&id, length))
                .await;
        }

        let data = self
            .backend
            .partial_download_by_id(&file.remote_id, &file.object_name(), range.start, range.end)
            .await?;

        let data = Arc::new(data);
        let (id, start, shared) = (file.id.clone(), range.start, data.clone());
        if let Some(Err(e)) = self
            .with_cache(move |cache| cache.write_at(&id, start, &shared))
            .await
        {
            warn!(file_id = %file.id, error = %e, "Failed to write chunk to cache");
        }
        let data = Arc::try_unwrap(data).unwrap_or_else(|shared| shared.to_vec());

        Ok(DownloadedChunk {
            data,
            eof: range.eof,
        })
    }

    async fn read_cached(&self, file: &FileObject, range: ReadRange) -> Option<Vec<u8>> {
        let (id, length) = (file.id.clone(), file.length);
        let result = self
            .with_cache(move |cache| {
                if !cache.has_file(&id, length) {
                    return None;
                }
                Some(cache.read(&id, range.start, Some(range.end)))
            })
            .await
            .flatten();

        match result {
            Some(Ok(data)) => {
                debug!(file_id = %file.id, start = range.start, "Cache HIT");
                Some(data)
            }
            Some(Err(e)) => {
                warn!(file_id = %file.id, error = %e, "Cache read failed, falling back to storage");
                None
            }
            None => {
                debug!(file_id = %file.id, start = range.start, "Cache MISS");
                None
            }
        }
    }

    /// Run a blocking cache operation off the async executor
    async fn with_cache<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&DiskCache) -> T + Send + 'static,
    {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || f(&cache)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Cache task failed");
                None
            }
        }
    }

    async fn remove_cached(&self, file_id: &str) {
        let id = file_id.to_string();
        match self.with_cache(move |cache| cache.remove_file(&id)).await {
            Some(Ok(())) => debug!(file_id = file_id, "Removed from cache"),
            Some(Err(e)) => warn!(file_id = file_id, error = %e, "Error removing cached file"),
            None => {}
        }
    }

    /// Remove a file everywhere it lives
    ///
    /// Drops the cache entry, cancels an unfinished multipart upload or else
    /// deletes the stored object, then clears metadata even if the backend
    /// call failed.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), TransferError> {
        let file = self.metadata.get_file(file_id).await?;
        info!(file_id = file_id, "Deleting file by metadata (storage errors are OK)");
        self.remove_cached(file_id).await;

        let pending_upload = match self.metadata.get_upload(file_id).await {
            Ok(session) if file.chunks > 1 && session.state != UploadState::Complete => {
                Some(session.target.upload_id)
            }
            _ => None,
        };

        let cancelled = match pending_upload {
            Some(upload_id) => match self.backend.cancel_large_file(&upload_id, &file.object_name()).await {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    warn!(file_id = file_id, error = %e, "Failed to cancel multipart upload");
                    false
                }
            },
            None => false,
        };

        if cancelled {
            info!(file_id = file_id, "Large upload cancelled");
        } else if !file.remote_id.is_empty() {
            match self.backend.delete_file(&file.remote_id, &file.object_name()).await {
                Ok(_) => info!(file_id = file_id, "Deleted from storage"),
                Err(e) => warn!(
                    file_id = file_id,
                    remote_id = %file.remote_id,
                    error = %e,
                    "Failed to delete stored file"
                ),
            }
        }

        self.metadata.clear(file_id).await?;
        Ok(())
    }

    /// Best-effort credential refresh, safe to call on a schedule
    pub async fn reauthorize(&self) {
        self.backend.reauthorize().await;
    }
}
