//! In-memory backend for coordinator and transfer tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{require_remote_id, RemoteObject, StorageBackend, StorageError};
use crate::chunks::{sha1_hex, FileChunk};
use crate::config::StorageKind;
use crate::metadata::{UploadSession, UploadTarget};

#[derive(Default)]
pub(crate) struct MockBackend {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    parts: Mutex<HashMap<String, BTreeMap<u64, Vec<u8>>>>,
    /// Remaining forced failures per chunk number
    failures: Mutex<HashMap<u64, usize>>,
    pub finish_calls: Mutex<Vec<Vec<String>>>,
    pub cancelled: Mutex<Vec<String>>,
    /// Object names passed to upload calls
    pub names: Mutex<Vec<String>>,
    pub part_attempts: AtomicUsize,
    pub downloads: AtomicUsize,
    pub authorizations: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` uploads of `chunk` fail
    pub fn fail_chunk(&self, chunk: u64, times: usize) {
        self.failures.lock().unwrap().insert(chunk, times);
    }

    fn maybe_fail(&self, chunk: u64) -> Result<(), StorageError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&chunk) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(anyhow::anyhow!("injected failure for chunk {}", chunk).into())
            }
            _ => Ok(()),
        }
    }

    fn new_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn authorize(&self) -> Result<(), StorageError> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn init_upload(&self, _file_id: &str) -> Result<UploadTarget, StorageError> {
        Ok(UploadTarget {
            upload_url: "mock://upload".to_string(),
            upload_id: "bucket".to_string(),
            ..Default::default()
        })
    }

    async fn init_large_upload(
        &self,
        name: &str,
        _file_id: &str,
    ) -> Result<UploadTarget, StorageError> {
        self.names.lock().unwrap().push(name.to_string());
        let upload_id = self.new_id("large");
        self.parts
            .lock()
            .unwrap()
            .insert(upload_id.clone(), BTreeMap::new());
        Ok(UploadTarget {
            upload_id,
            ..Default::default()
        })
    }

    async fn upload_single_chunk(
        &self,
        chunk: &FileChunk,
        _session: &UploadSession,
    ) -> Result<RemoteObject, StorageError> {
        self.maybe_fail(chunk.chunk_num)?;
        self.names.lock().unwrap().push(chunk.filename.clone());
        let remote_id = self.new_id("object");
        self.objects
            .lock()
            .unwrap()
            .insert(remote_id.clone(), chunk.data.clone());
        Ok(RemoteObject {
            remote_id,
            length: chunk.data.len() as u64,
        })
    }

    async fn upload_part(
        &self,
        chunk: &FileChunk,
        session: &UploadSession,
    ) -> Result<String, StorageError> {
        self.part_attempts.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail(chunk.chunk_num)?;
        let mut parts = self.parts.lock().unwrap();
        let upload = parts
            .get_mut(&session.target.upload_id)
            .ok_or_else(|| StorageError::NotFound(session.target.upload_id.clone()))?;
        upload.insert(chunk.chunk_num, chunk.data.clone());
        Ok(sha1_hex(&chunk.data))
    }

    async fn cancel_large_file(
        &self,
        remote_id: &str,
        _filename: &str,
    ) -> Result<bool, StorageError> {
        let removed = self.parts.lock().unwrap().remove(remote_id).is_some();
        if removed {
            self.cancelled.lock().unwrap().push(remote_id.to_string());
        }
        Ok(removed)
    }

    async fn delete_file(&self, remote_id: &str, _filename: &str) -> Result<bool, StorageError> {
        require_remote_id(remote_id)?;
        match self.objects.lock().unwrap().remove(remote_id) {
            Some(_) => Ok(true),
            None => Err(StorageError::NotFound(remote_id.to_string())),
        }
    }

    async fn finish_large_upload(
        &self,
        remote_id: &str,
        _filename: &str,
        checksums: &[String],
    ) -> Result<RemoteObject, StorageError> {
        self.finish_calls.lock().unwrap().push(checksums.to_vec());
        let parts = self
            .parts
            .lock()
            .unwrap()
            .remove(remote_id)
            .ok_or_else(|| StorageError::NotFound(remote_id.to_string()))?;

        if parts.len() != checksums.len() {
            return Err(anyhow::anyhow!("missing parts").into());
        }
        let mut data = Vec::new();
        for (expected, part) in checksums.iter().zip(parts.values()) {
            if sha1_hex(part) != *expected {
                return Err(anyhow::anyhow!("checksum mismatch").into());
            }
            data.extend_from_slice(part);
        }

        let object_id = self.new_id("object");
        let length = data.len() as u64;
        self.objects.lock().unwrap().insert(object_id.clone(), data);
        Ok(RemoteObject {
            remote_id: object_id,
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
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(remote_id)
            .ok_or_else(|| StorageError::NotFound(remote_id.to_string()))?;
        let end = (end as usize).min(data.len().saturating_sub(1));
        Ok(data[start as usize..=end].to_vec())
    }
}
