//! Top-level error type for upload and download orchestration

use crate::metadata::MetadataError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("chunk {chunk} is outside the declared {total} chunks")]
    InvalidChunk { chunk: u64, total: u64 },

    #[error("{length} stored bytes make {expected} chunks, not {chunks}")]
    ChunkCountMismatch {
        length: u64,
        chunks: u64,
        expected: u64,
    },

    #[error("file {0} has no stored object yet")]
    NotUploaded(String),

    #[error("upload of {0} did not complete")]
    Incomplete(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransferError {
    /// Whether this is the retry ceiling being hit rather than a hard failure
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            TransferError::Storage(StorageError::ExceededMaximumAttempts)
        )
    }
}
