//! Client-side chunked upload and download drivers
//!
//! Both directions fan chunk jobs out over the bounded [`pool`](crate::pool).
//! Uploads hold back the final chunk until every other chunk has landed, so
//! the response to that last request is the completion signal.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunks::{ChunkLayout, ReadRange};
use crate::error::TransferError;
use crate::pool::{run_jobs, MAX_TRANSFER_THREADS};
use crate::transfer::TransferService;

/// Upload an already-encrypted chunk stream from `path`; returns the file ID
///
/// On failure the partially uploaded file is aborted before the error is
/// returned.
pub async fn upload_stream(
    service: &Arc<TransferService>,
    path: &Path,
    name: &str,
    cancel: &CancellationToken,
) -> Result<String, TransferError> {
    let layout = service.layout();
    let length = tokio::fs::metadata(path).await?.len();
    if length == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is empty", path.display()),
        )
        .into());
    }
    let chunks = layout.num_chunks_stored(length);

    let file_id = service.init_upload(name, length, chunks).await?;
    info!(file_id = %file_id, name = name, length = length, chunks = chunks, "Uploading file");

    match send_chunks(service, path, &file_id, layout, length, chunks, cancel).await {
        Ok(()) => {
            info!(file_id = %file_id, "Upload complete");
            Ok(file_id)
        }
        Err(e) => {
            warn!(file_id = %file_id, error = %e, "Upload failed, aborting");
            if let Err(abort) = service.abort_upload(&file_id).await {
                warn!(file_id = %file_id, error = %abort, "Failed to abort upload");
            }
            Err(e)
        }
    }
}

async fn send_chunks(
    service: &Arc<TransferService>,
    path: &Path,
    file_id: &str,
    layout: ChunkLayout,
    length: u64,
    chunks: u64,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let jobs = (1..chunks).map(|chunk| boundaries(layout, chunk, length, chunks));

    let (worker_service, worker_path, worker_id) =
        (service.clone(), path.to_path_buf(), file_id.to_string());
    run_jobs(MAX_TRANSFER_THREADS, cancel, jobs, move |(chunk, range)| {
        let service = worker_service.clone();
        let path = worker_path.clone();
        let file_id = worker_id.clone();
        async move {
            let data = read_range(&path, range).await?;
            service.upload_chunk(&file_id, chunk, data).await?;
            debug!(file_id = %file_id, chunk = chunk, "Chunk uploaded");
            Ok(())
        }
    })
    .await?;

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let (_, range) = boundaries(layout, chunks, length, chunks)?;
    let data = read_range(path, range).await?;
    if service.upload_chunk(file_id, chunks, data).await? {
        Ok(())
    } else {
        Err(TransferError::Incomplete(file_id.to_string()))
    }
}

/// Download every chunk of `file_id` into a new file at `out`
///
/// Chunk 1 is fetched alone, the remaining chunks go through the pool.
pub async fn download_to(
    service: &Arc<TransferService>,
    file_id: &str,
    out: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let file = service.file_info(file_id).await?;
    if file.remote_id.is_empty() {
        return Err(TransferError::NotUploaded(file.id));
    }

    let output = File::create(out).await?;
    output.set_len(file.length).await?;
    drop(output);

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    // Chunk 1 opens the cache reservation the pooled chunks fill
    let layout = service.layout();
    let (_, first) = boundaries(layout, 1, file.length, file.chunks)?;
    let downloaded = service.download_chunk(&file.id, 1).await?;
    write_at(out, first.start, &downloaded.data).await?;

    let jobs = (2..=file.chunks).map(|chunk| boundaries(layout, chunk, file.length, file.chunks));

    let (worker_service, worker_out, worker_id) =
        (service.clone(), out.to_path_buf(), file.id.clone());
    run_jobs(MAX_TRANSFER_THREADS, cancel, jobs, move |(chunk, range)| {
        let service = worker_service.clone();
        let out = worker_out.clone();
        let file_id = worker_id.clone();
        async move {
            let downloaded = service.download_chunk(&file_id, chunk).await?;
            write_at(&out, range.start, &downloaded.data).await?;
            debug!(file_id = %file_id, chunk = chunk, eof = downloaded.eof, "Chunk downloaded");
            Ok(())
        }
    })
    .await?;

    info!(file_id = %file.id, out = %out.display(), length = file.length, "Download complete");
    Ok(file.length)
}

fn boundaries(
    layout: ChunkLayout,
    chunk: u64,
    length: u64,
    total: u64,
) -> Result<(u64, ReadRange), TransferError> {
    layout
        .read_boundaries(chunk, length)
        .map(|range| (chunk, range))
        .ok_or(TransferError::InvalidChunk { chunk, total })
}

async fn read_range(path: &Path, range: ReadRange) -> Result<Vec<u8>, TransferError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut data = vec![0u8; range.len() as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use crate::config::CacheConfig;
    use crate::metadata::MemoryMetadataStore;
    use crate::storage::mock::MockBackend;
    use crate::upload::RetryPolicy;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        backend: Arc<MockBackend>,
        service: Arc<TransferService>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(CacheConfig::new(dir.path().join("cache"), 1000, 1000))
            .unwrap()
            .with_chunk_size(4);
        let backend = Arc::new(MockBackend::new());
        let service = TransferService::new(
            backend.clone(),
            Arc::new(MemoryMetadataStore::new()),
            cache,
        )
        .with_retry_policy(RetryPolicy::immediate(5))
        .with_layout(ChunkLayout::new(4, 2));
        Fixture {
            dir,
            backend,
            service: Arc::new(service),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let f = fixture();
        let source = f.dir.path().join("source.bin");
        let data = payload(6 * 7 + 3);
        std::fs::write(&source, &data).unwrap();

        let cancel = CancellationToken::new();
        let id = upload_stream(&f.service, &source, "source.bin", &cancel)
            .await
            .unwrap();

        let info = f.service.file_info(&id).await.unwrap();
        assert_eq!(info.chunks, 8);
        assert_eq!(info.length, data.len() as u64);
        assert_eq!(f.backend.finish_calls.lock().unwrap().len(), 1);

        let out = f.dir.path().join("out.bin");
        let written = download_to(&f.service, &id, &out, &cancel).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[tokio::test]
    async fn test_pool_download_fills_cache() {
        let f = fixture();
        let source = f.dir.path().join("source.bin");
        let data = payload(6 * 9 + 1);
        std::fs::write(&source, &data).unwrap();
        let cancel = CancellationToken::new();
        let id = upload_stream(&f.service, &source, "source.bin", &cancel)
            .await
            .unwrap();

        let out = f.dir.path().join("first.bin");
        download_to(&f.service, &id, &out, &cancel).await.unwrap();
        let fetched = f.backend.downloads.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(fetched, 10);

        let again = f.dir.path().join("second.bin");
        download_to(&f.service, &id, &again, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&again).unwrap(), data);
        assert_eq!(f.backend.downloads.load(std::sync::atomic::Ordering::SeqCst), fetched);
    }

    #[tokio::test]
    async fn test_single_chunk_upload() {
        let f = fixture();
        let source = f.dir.path().join("small.bin");
        std::fs::write(&source, b"tiny").unwrap();

        let id = upload_stream(&f.service, &source, "small.bin", &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.backend.finish_calls.lock().unwrap().is_empty());
        assert!(!f.service.file_info(&id).await.unwrap().remote_id.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let f = fixture();
        let source = f.dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let result = upload_stream(&f.service, &source, "empty.bin", &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_upload() {
        let f = fixture();
        let source = f.dir.path().join("source.bin");
        std::fs::write(&source, payload(20)).unwrap();
        f.backend.fail_chunk(2, 10);

        let result = upload_stream(&f.service, &source, "source.bin", &CancellationToken::new()).await;
        assert!(result.as_ref().is_err_and(|e| e.is_exhausted()));
        assert_eq!(f.backend.cancelled.lock().unwrap().len(), 1);
        assert!(f.backend.finish_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_aborted() {
        let f = fixture();
        let source = f.dir.path().join("source.bin");
        std::fs::write(&source, payload(20)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = upload_stream(&f.service, &source, "source.bin", &cancel).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(f.backend.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_download_of_pending_upload_fails() {
        let f = fixture();
        let id = f.service.init_upload("pending.bin", 10, 2).await.unwrap();
        let out = f.dir.path().join("out.bin");

        let result = download_to(&f.service, &id, &out, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::NotUploaded(_))));
        assert!(!out.exists());
    }
}
