//! chunkstore - chunked encrypted file transfer
//!
//! Files travel as a sequence of independently encrypted chunks to a B2,
//! S3-compatible or local storage backend. A bounded disk cache absorbs
//! repeated reads of recently downloaded objects.

pub mod cache;
pub mod chunks;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod storage;
pub mod transfer;
pub mod upload;

pub use cache::DiskCache;
pub use chunks::{ChunkLayout, FileChunk, ReadRange, CHUNK_SIZE, TOTAL_OVERHEAD};
pub use config::Config;
pub use error::TransferError;
pub use metadata::{FileObject, JsonMetadataStore, MemoryMetadataStore, MetadataStore};
pub use storage::{StorageBackend, StorageError};
pub use transfer::{DownloadedChunk, TransferService};
pub use upload::{RetryPolicy, UploadCoordinator};
