//! Metadata records

use serde::{Deserialize, Serialize};

/// A stored object as seen by the transfer core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileObject {
    pub id: String,
    pub name: String,
    /// Stored (ciphertext) length; declared length until the upload completes
    pub length: u64,
    pub chunks: u64,
    /// Backend object ID, empty until the upload completes
    #[serde(default)]
    pub remote_id: String,
}

impl FileObject {
    pub fn new(id: impl Into<String>, name: impl Into<String>, length: u64, chunks: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            length,
            chunks,
            remote_id: String::new(),
        }
    }

    /// Name the object is stored under remotely
    ///
    /// Prefixed with the file ID so two files sharing a display name never
    /// land on the same key.
    pub fn object_name(&self) -> String {
        format!("{}/{}", self.id, self.name)
    }
}

/// Where the backend expects chunks to be sent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub token: String,
    /// Bucket ID for single uploads, large-file / multipart upload ID otherwise
    #[serde(default)]
    pub upload_id: String,
    /// Target is a local/dummy store rather than a remote endpoint
    #[serde(default)]
    pub local: bool,
}

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Initialized,
    Uploading,
    Finalizing,
    Complete,
}

/// Resumable multipart upload state for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub file_id: String,
    pub name: String,
    #[serde(flatten)]
    pub target: UploadTarget,
    /// One slot per chunk, index 0 holds chunk 1
    pub checksums: Vec<Option<String>>,
    pub state: UploadState,
}

impl UploadSession {
    pub fn new(file_id: impl Into<String>, name: impl Into<String>, chunks: u64) -> Self {
        Self {
            file_id: file_id.into(),
            name: name.into(),
            target: UploadTarget::default(),
            checksums: vec![None; chunks as usize],
            state: UploadState::Initialized,
        }
    }

    /// Number of populated checksum slots
    pub fn received(&self) -> usize {
        self.checksums.iter().filter(|c| c.is_some()).count()
    }
}

/// A file together with its upload session, the unit both stores persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file: FileObject,
    #[serde(default)]
    pub upload: Option<UploadSession>,
}

impl FileRecord {
    pub fn new(file: FileObject) -> Self {
        Self { file, upload: None }
    }

    pub(crate) fn start_upload(&mut self, name: &str) {
        self.upload = Some(UploadSession::new(
            self.file.id.clone(),
            name,
            self.file.chunks,
        ));
    }

    pub(crate) fn set_remote(&mut self, remote_id: &str, length: u64) {
        self.file.remote_id = remote_id.to_string();
        self.file.length = length;
    }

    pub(crate) fn set_target(&mut self, target: &UploadTarget) -> Option<()> {
        let upload = self.upload.as_mut()?;
        let upload_id = if target.upload_id.is_empty() {
            std::mem::take(&mut upload.target.upload_id)
        } else {
            target.upload_id.clone()
        };
        upload.target = UploadTarget {
            upload_id,
            ..target.clone()
        };
        Some(())
    }

    /// `None` if there is no session, `Some(false)` if the index is invalid
    pub(crate) fn set_checksum(&mut self, chunk: u64, checksum: &str) -> Option<bool> {
        let upload = self.upload.as_mut()?;
        Some(set_checksum_slot(&mut upload.checksums, chunk, checksum))
    }

    pub(crate) fn transition(&mut self, from: UploadState, to: UploadState) -> Option<bool> {
        let upload = self.upload.as_mut()?;
        if upload.state != from {
            return Some(false);
        }
        upload.state = to;
        Some(true)
    }
}

/// Set a 1-based checksum slot, returning false if the index is out of range
pub(crate) fn set_checksum_slot(slots: &mut [Option<String>], chunk: u64, checksum: &str) -> bool {
    match chunk.checked_sub(1).and_then(|i| slots.get_mut(i as usize)) {
        Some(slot) => {
            *slot = Some(checksum.to_string());
            true
        }
        None => false,
    }
}

/// Ordered checksums if every slot is populated
pub fn completed_checksums(slots: &[Option<String>], total_chunks: u64) -> Option<Vec<String>> {
    if slots.len() as u64 != total_chunks {
        return None;
    }
    slots.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_is_scoped_by_file_id() {
        let a = FileObject::new("id-a", "report.bin", 10, 2);
        let b = FileObject::new("id-b", "report.bin", 10, 2);
        assert_eq!(a.object_name(), "id-a/report.bin");
        assert_ne!(a.object_name(), b.object_name());
    }

    #[test]
    fn test_checksum_slots_are_index_addressed() {
        let mut slots = vec![None; 3];
        assert!(set_checksum_slot(&mut slots, 3, "c"));
        assert!(set_checksum_slot(&mut slots, 1, "a"));
        assert_eq!(completed_checksums(&slots, 3), None);

        assert!(set_checksum_slot(&mut slots, 2, "b"));
        assert!(set_checksum_slot(&mut slots, 2, "b2"));
        assert_eq!(
            completed_checksums(&slots, 3),
            Some(vec!["a".to_string(), "b2".to_string(), "c".to_string()])
        );
        assert!(!set_checksum_slot(&mut slots, 0, "x"));
        assert!(!set_checksum_slot(&mut slots, 4, "x"));
    }

    #[test]
    fn test_session_serialization() {
        let mut session = UploadSession::new("f1", "name", 2);
        session.target.upload_id = "large-1".to_string();
        session.checksums[0] = Some("abc".to_string());

        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("uploadId"));
        assert!(json.contains("\"state\":\"initialized\""));

        let decoded: UploadSession = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, session);
        assert_eq!(decoded.received(), 1);
    }
}
