//! JSON-file metadata store
//!
//! One document per file under a directory, replaced atomically on each
//! update. Used by the CLI so uploads survive across invocations.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{FileObject, FileRecord, UploadSession, UploadState, UploadTarget};
use super::{MetadataError, MetadataStore};

/// Metadata persisted as `<dir>/<file_id>.json`
pub struct JsonMetadataStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonMetadataStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, file_id: &str) -> PathBuf {
        // IDs are generated internally, but never let one escape the directory
        let safe = file_id.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("{}.json", safe))
    }

    async fn load(&self, file_id: &str) -> Result<FileRecord, MetadataError> {
        let path = self.record_path(file_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetadataError::FileNotFound(file_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, record: &FileRecord) -> Result<(), MetadataError> {
        let path = self.record_path(&record.file.id);
        let data = serde_json::to_vec_pretty(record)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(file_id = %record.file.id, path = %path.display(), "Saved metadata record");
        Ok(())
    }

    async fn modify<T>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut FileRecord) -> Result<T, MetadataError>,
    ) -> Result<T, MetadataError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(file_id).await?;
        let result = f(&mut record)?;
        self.save(&record)?;
        Ok(result)
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn create_file(&self, file: FileObject) -> Result<(), MetadataError> {
        let _guard = self.write_lock.lock().await;
        self.save(&FileRecord::new(file))
    }

    async fn get_file(&self, file_id: &str) -> Result<FileObject, MetadataError> {
        Ok(self.load(file_id).await?.file)
    }

    async fn update_metadata(
        &self,
        file_id: &str,
        remote_id: &str,
        length: u64,
    ) -> Result<(), MetadataError> {
        self.modify(file_id, |r| {
            r.set_remote(remote_id, length);
            Ok(())
        })
        .await
    }

    async fn create_upload(&self, file_id: &str, name: &str) -> Result<(), MetadataError> {
        self.modify(file_id, |r| {
            r.start_upload(name);
            Ok(())
        })
        .await
    }

    async fn get_upload(&self, file_id: &str) -> Result<UploadSession, MetadataError> {
        self.load(file_id)
            .await?
            .upload
            .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
    }

    async fn update_upload_values(
        &self,
        file_id: &str,
        target: &UploadTarget,
    ) -> Result<(), MetadataError> {
        self.modify(file_id, |r| {
            r.set_target(target)
                .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
        })
        .await
    }

    async fn update_checksum(
        &self,
        file_id: &str,
        chunk: u64,
        checksum: &str,
    ) -> Result<Vec<Option<String>>, MetadataError> {
        self.modify(file_id, |r| match r.set_checksum(chunk, checksum) {
            None => Err(MetadataError::UploadNotFound(file_id.to_string())),
            Some(false) => Err(MetadataError::InvalidChunk {
                file_id: file_id.to_string(),
                chunk,
            }),
            Some(true) => Ok(r
                .upload
                .as_ref()
                .map(|u| u.checksums.clone())
                .unwrap_or_default()),
        })
        .await
    }

    async fn transition_upload(
        &self,
        file_id: &str,
        from: UploadState,
        to: UploadState,
    ) -> Result<bool, MetadataError> {
        self.modify(file_id, |r| {
            r.transition(from, to)
                .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
        })
        .await
    }

    async fn clear(&self, file_id: &str) -> Result<(), MetadataError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.record_path(file_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonMetadataStore::open(dir.path()).unwrap();
            store
                .create_file(FileObject::new("f1", "name", 56, 2))
                .await
                .unwrap();
            store.create_upload("f1", "name").await.unwrap();
            store.update_checksum("f1", 1, "aa").await.unwrap();
        }

        let store = JsonMetadataStore::open(dir.path()).unwrap();
        let session = store.get_upload("f1").await.unwrap();
        assert_eq!(session.checksums, vec![Some("aa".to_string()), None]);
        assert_eq!(session.state, UploadState::Initialized);

        let slots = store.update_checksum("f1", 2, "bb").await.unwrap();
        assert_eq!(slots.iter().flatten().count(), 2);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        store
            .create_file(FileObject::new("f1", "name", 1, 1))
            .await
            .unwrap();

        store.clear("f1").await.unwrap();
        store.clear("f1").await.unwrap();
        assert!(matches!(
            store.get_file("f1").await,
            Err(MetadataError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_record_path_stays_in_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        let path = store.record_path("../escape");
        assert_eq!(path.parent().unwrap(), dir.path());
    }
}
