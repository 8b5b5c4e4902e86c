//! In-process metadata store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::types::{FileObject, FileRecord, UploadSession, UploadState, UploadTarget};
use super::{MetadataError, MetadataStore};

/// Metadata kept in a mutex-guarded map, for tests and single-process use
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<String, FileRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, FileRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_record<T>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut FileRecord) -> T,
    ) -> Result<T, MetadataError> {
        let mut records = self.records();
        let record = records
            .get_mut(file_id)
            .ok_or_else(|| MetadataError::FileNotFound(file_id.to_string()))?;
        Ok(f(record))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_file(&self, file: FileObject) -> Result<(), MetadataError> {
        self.records().insert(file.id.clone(), FileRecord::new(file));
        Ok(())
    }

    async fn get_file(&self, file_id: &str) -> Result<FileObject, MetadataError> {
        self.with_record(file_id, |r| r.file.clone())
    }

    async fn update_metadata(
        &self,
        file_id: &str,
        remote_id: &str,
        length: u64,
    ) -> Result<(), MetadataError> {
        self.with_record(file_id, |r| r.set_remote(remote_id, length))
    }

    async fn create_upload(&self, file_id: &str, name: &str) -> Result<(), MetadataError> {
        self.with_record(file_id, |r| r.start_upload(name))
    }

    async fn get_upload(&self, file_id: &str) -> Result<UploadSession, MetadataError> {
        self.with_record(file_id, |r| r.upload.clone())?
            .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
    }

    async fn update_upload_values(
        &self,
        file_id: &str,
        target: &UploadTarget,
    ) -> Result<(), MetadataError> {
        self.with_record(file_id, |r| r.set_target(target))?
            .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
    }

    async fn update_checksum(
        &self,
        file_id: &str,
        chunk: u64,
        checksum: &str,
    ) -> Result<Vec<Option<String>>, MetadataError> {
        self.with_record(file_id, |r| match r.set_checksum(chunk, checksum) {
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
        })?
    }

    async fn transition_upload(
        &self,
        file_id: &str,
        from: UploadState,
        to: UploadState,
    ) -> Result<bool, MetadataError> {
        self.with_record(file_id, |r| r.transition(from, to))?
            .ok_or_else(|| MetadataError::UploadNotFound(file_id.to_string()))
    }

    async fn clear(&self, file_id: &str) -> Result<(), MetadataError> {
        self.records().remove(file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_session_lifecycle() {
        let store = MemoryMetadataStore::new();
        store
            .create_file(FileObject::new("f1", "name", 100, 2))
            .await
            .unwrap();
        store.create_upload("f1", "name").await.unwrap();

        store
            .update_upload_values(
                "f1",
                &UploadTarget {
                    upload_id: "large".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Empty upload ID keeps the previous one
        store
            .update_upload_values(
                "f1",
                &UploadTarget {
                    upload_url: "https://upload".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let session = store.get_upload("f1").await.unwrap();
        assert_eq!(session.target.upload_id, "large");
        assert_eq!(session.target.upload_url, "https://upload");
        assert_eq!(session.checksums.len(), 2);

        let slots = store.update_checksum("f1", 2, "bb").await.unwrap();
        assert_eq!(slots, vec![None, Some("bb".to_string())]);
        assert!(matches!(
            store.update_checksum("f1", 3, "cc").await,
            Err(MetadataError::InvalidChunk { .. })
        ));

        assert!(store
            .transition_upload("f1", UploadState::Initialized, UploadState::Uploading)
            .await
            .unwrap());
        assert!(!store
            .transition_upload("f1", UploadState::Initialized, UploadState::Uploading)
            .await
            .unwrap());

        store.update_metadata("f1", "remote", 156).await.unwrap();
        let file = store.get_file("f1").await.unwrap();
        assert_eq!((file.remote_id.as_str(), file.length), ("remote", 156));

        store.clear("f1").await.unwrap();
        assert!(matches!(
            store.get_file("f1").await,
            Err(MetadataError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_upload_session() {
        let store = MemoryMetadataStore::new();
        store
            .create_file(FileObject::new("f1", "name", 10, 1))
            .await
            .unwrap();
        assert!(matches!(
            store.get_upload("f1").await,
            Err(MetadataError::UploadNotFound(_))
        ));
    }
}
