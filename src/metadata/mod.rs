//! File metadata and upload-state persistence
//!
//! The transfer core only needs a narrow contract from its metadata database:
//! file length/chunk count/remote ID, and the per-file multipart upload state.

pub mod json;
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use json::JsonMetadataStore;
pub use memory::MemoryMetadataStore;
pub use types::*;

/// Metadata store errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("no metadata for file {0}")]
    FileNotFound(String),

    #[error("no upload session for file {0}")]
    UploadNotFound(String),

    #[error("invalid chunk index {chunk} for file {file_id}")]
    InvalidChunk { file_id: String, chunk: u64 },

    #[error("metadata I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistence contract used by the upload coordinator and transfer service
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new file record
    async fn create_file(&self, file: FileObject) -> Result<(), MetadataError>;

    async fn get_file(&self, file_id: &str) -> Result<FileObject, MetadataError>;

    /// Record the remote object ID and stored length once known
    async fn update_metadata(
        &self,
        file_id: &str,
        remote_id: &str,
        length: u64,
    ) -> Result<(), MetadataError>;

    /// Start an upload session with one empty checksum slot per chunk
    async fn create_upload(&self, file_id: &str, name: &str) -> Result<(), MetadataError>;

    async fn get_upload(&self, file_id: &str) -> Result<UploadSession, MetadataError>;

    /// Persist the upload target returned by backend initialization
    ///
    /// An empty `upload_id` in `target` keeps the existing one.
    async fn update_upload_values(
        &self,
        file_id: &str,
        target: &UploadTarget,
    ) -> Result<(), MetadataError>;

    /// Store the checksum for a 1-based chunk index and return all slots
    ///
    /// Slots are index-addressed, so re-recording a chunk overwrites it.
    async fn update_checksum(
        &self,
        file_id: &str,
        chunk: u64,
        checksum: &str,
    ) -> Result<Vec<Option<String>>, MetadataError>;

    /// Move the upload from `from` to `to` if it is currently in `from`
    async fn transition_upload(
        &self,
        file_id: &str,
        from: UploadState,
        to: UploadState,
    ) -> Result<bool, MetadataError>;

    /// Remove the file and any upload session
    async fn clear(&self, file_id: &str) -> Result<(), MetadataError>;
}
