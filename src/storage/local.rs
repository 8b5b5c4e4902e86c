//! Local disk storage backend
//!
//! Stores finished objects as `<root>/<file_id>` and emulates multipart
//! uploads by staging parts under `<root>/.parts/<upload_id>/` until the
//! upload is finished.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{require_remote_id, RemoteObject, StorageBackend, StorageError};
use crate::chunks::{sha1_hex, FileChunk};
use crate::config::{LocalConfig, StorageKind};
use crate::metadata::{UploadSession, UploadTarget};

/// Directory holding staged multipart parts
const PARTS_DIR: &str = ".parts";

/// Filesystem-backed storage
pub struct LocalBackend {
    root: PathBuf,
    limit: Option<u64>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            root: config.root,
            limit: config.limit,
        }
    }

    fn object_path(&self, remote_id: &str) -> PathBuf {
        self.root.join(sanitize(remote_id))
    }

    fn parts_path(&self, upload_id: &str) -> PathBuf {
        self.root.join(PARTS_DIR).join(sanitize(upload_id))
    }

    /// Fail if writing `incoming` more bytes would exceed the configured limit
    async fn check_limit(&self, incoming: u64) -> Result<(), StorageError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };

        let root = self.root.clone();
        let used = tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .map_err(anyhow::Error::from)??;

        if used + incoming > limit {
            return Err(StorageError::LimitExceeded {
                used,
                requested: incoming,
                limit,
            });
        }
        Ok(())
    }

    /// Write `data` to `path` through a temp file so readers never see a partial object
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn authorize(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.join(PARTS_DIR)).await?;
        Ok(())
    }

    // Path credentials never expire
    async fn reauthorize(&self) {}

    async fn init_upload(&self, file_id: &str) -> Result<UploadTarget, StorageError> {
        Ok(UploadTarget {
            upload_id: file_id.to_string(),
            local: true,
            ..Default::default()
        })
    }

    async fn init_large_upload(
        &self,
        name: &str,
        file_id: &str,
    ) -> Result<UploadTarget, StorageError> {
        fs::create_dir_all(self.parts_path(file_id)).await?;
        debug!(file_id = file_id, name = name, "Started local multipart upload");
        Ok(UploadTarget {
            upload_id: file_id.to_string(),
            local: true,
            ..Default::default()
        })
    }

    async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        _session: &UploadSession,
    ) -> Result<RemoteObject, StorageError> {
        self.check_limit(chunk.data.len() as u64).await?;
        self.write_atomic(&self.object_path(&chunk.file_id), &chunk.data)
            .await?;

        info!(file_id = %chunk.file_id, size = chunk.data.len(), "Stored file locally");
        Ok(RemoteObject {
            remote_id: chunk.file_id.clone(),
            length: chunk.data.len() as u64,
        })
    }

    async fn upload_part(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<String, StorageError> {
        self.check_limit(chunk.data.len() as u64).await?;

        let dir = self.parts_path(&session.target.upload_id);
        fs::create_dir_all(&dir).await?;
        self.write_atomic(&dir.join(chunk.chunk_num.to_string()), &chunk.data)
            .await?;

        debug!(
            upload_id = %session.target.upload_id,
            chunk = chunk.chunk_num,
            size = chunk.data.len(),
            "Stored local part"
        );
        Ok(sha1_hex(&chunk.data))
    }

    async fn cancel_large_file(
        &self,
        remote_id: &str,
        _filename: &str,
    ) -> Result<bool, StorageError> {
        if remote_id.is_empty() {
            return Ok(false);
        }
        let dir = self.parts_path(remote_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(upload_id = remote_id, "Canceled local multipart upload");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, remote_id: &str, _filename: &str) -> Result<bool, StorageError> {
        require_remote_id(remote_id)?;
        match fs::remove_file(self.object_path(remote_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(remote_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_large_upload(
        &self,
        remote_id: &str,
        _filename: &str,
        checksums: &[String],
    ) -> Result<RemoteObject, StorageError> {
        let dir = self.parts_path(remote_id);
        let target = self.object_path(remote_id);
        let tmp = target.with_extension("tmp");

        let mut out = fs::File::create(&tmp).await?;
        let mut length = 0u64;
        for (i, expected) in checksums.iter().enumerate() {
            let part = match fs::read(dir.join((i + 1).to_string()))
                .await
                .with_context(|| format!("part {} of {} was never uploaded", i + 1, remote_id))
            {
                Ok(part) => part,
                Err(e) => {
                    drop(out);
                    let _ = fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            let actual = sha1_hex(&part);
            if &actual != expected {
                drop(out);
                let _ = fs::remove_file(&tmp).await;
                return Err(anyhow::anyhow!(
                    "checksum mismatch for part {} of {}: expected {}, found {}",
                    i + 1,
                    remote_id,
                    expected,
                    actual
                )
                .into());
            }
            out.write_all(&part).await?;
            length += part.len() as u64;
        }
        out.flush().await?;
        drop(out);

        fs::rename(&tmp, &target).await?;
        fs::remove_dir_all(&dir).await?;

        info!(file_id = remote_id, size = length, "Finished local multipart upload");
        Ok(RemoteObject {
            remote_id: remote_id.to_string(),
            length,
        })
    }

    async fn partial_download_by_id(
        &self,
        remote_id: &str,
        _filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(remote_id);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(remote_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(start)).await?;
        let mut data = Vec::with_capacity(end.saturating_sub(start) as usize + 1);
        file.take(end.saturating_sub(start) + 1)
            .read_to_end(&mut data)
            .await?;
        Ok(data)
    }
}

/// Keep IDs from escaping the storage root
fn sanitize(id: &str) -> String {
    id.replace(['/', '\\', ':'], "_")
}

/// Total size of all regular files under `path`
pub(crate) fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let read_dir = match std::fs::read_dir(path) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in read_dir {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, limit: Option<u64>) -> LocalBackend {
        LocalBackend::new(LocalConfig {
            root: dir.path().join("uploads"),
            limit,
        })
    }

    fn chunk(file_id: &str, num: u64, total: u64, data: &[u8]) -> FileChunk {
        FileChunk {
            file_id: file_id.to_string(),
            filename: "name".to_string(),
            data: data.to_vec(),
            chunk_num: num,
            total_chunks: total,
        }
    }

    #[tokio::test]
    async fn test_single_upload_and_range_read() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, None);
        backend.authorize().await.unwrap();

        let target = backend.init_upload("f1").await.unwrap();
        assert!(target.local);

        let session = UploadSession::new("f1", "name", 1);
        let object = backend
            .upload_single_chunk(&chunk("f1", 1, 1, b"0123456789"), &session)
            .await
            .unwrap();
        assert_eq!(object.length, 10);

        let data = backend
            .partial_download_by_id(&object.remote_id, "name", 2, 5)
            .await
            .unwrap();
        assert_eq!(data, b"2345");

        // Ranges past the end are truncated to the object
        let tail = backend
            .partial_download_by_id(&object.remote_id, "name", 8, 20)
            .await
            .unwrap();
        assert_eq!(tail, b"89");
    }

    #[tokio::test]
    async fn test_multipart_out_of_order() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, None);
        backend.authorize().await.unwrap();

        let mut session = UploadSession::new("f2", "name", 2);
        session.target = backend.init_large_upload("name", "f2").await.unwrap();

        let second = backend
            .upload_part(&chunk("f2", 2, 2, b"world"), &session)
            .await
            .unwrap();
        let first = backend
            .upload_part(&chunk("f2", 1, 2, b"hello "), &session)
            .await
            .unwrap();

        let object = backend
            .finish_large_upload("f2", "name", &[first, second])
            .await
            .unwrap();
        assert_eq!(object.length, 11);

        let data = backend
            .partial_download_by_id("f2", "name", 0, 10)
            .await
            .unwrap();
        assert_eq!(data, b"hello world");
        assert!(!backend.parts_path("f2").exists());
    }

    #[tokio::test]
    async fn test_finish_rejects_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, None);
        backend.authorize().await.unwrap();

        let mut session = UploadSession::new("f3", "name", 1);
        session.target = backend.init_large_upload("name", "f3").await.unwrap();
        backend
            .upload_part(&chunk("f3", 1, 1, b"data"), &session)
            .await
            .unwrap();

        let result = backend
            .finish_large_upload("f3", "name", &["bogus".to_string()])
            .await;
        assert!(result.is_err());
        assert!(!backend.object_path("f3").exists());
    }

    #[tokio::test]
    async fn test_cancel_and_delete() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, None);
        backend.authorize().await.unwrap();

        backend.init_large_upload("name", "f4").await.unwrap();
        assert!(backend.cancel_large_file("f4", "name").await.unwrap());
        assert!(!backend.cancel_large_file("f4", "name").await.unwrap());

        assert!(matches!(
            backend.delete_file("", "name").await,
            Err(StorageError::EmptyRemoteId)
        ));
        assert!(matches!(
            backend.delete_file("missing", "name").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_limit() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, Some(8));
        backend.authorize().await.unwrap();

        let session = UploadSession::new("f5", "name", 1);
        backend
            .upload_single_chunk(&chunk("f5", 1, 1, b"12345"), &session)
            .await
            .unwrap();

        let result = backend
            .upload_single_chunk(&chunk("f6", 1, 1, b"12345"), &session)
            .await;
        assert!(matches!(result, Err(StorageError::LimitExceeded { .. })));
    }
}
