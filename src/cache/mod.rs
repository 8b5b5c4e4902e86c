//! Disk caching layer
//!
//! Serves chunk reads of recently downloaded objects from local disk.
//! Cache failures are never fatal to a transfer; callers fall back to the
//! storage backend.

mod disk_cache;
mod state;

pub use disk_cache::DiskCache;

/// Errors from cache reads and writes
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache not available")]
    Disabled,

    #[error("{0} is not cached")]
    NotCached(String),

    #[error("range {start}..={end} outside cached object of {size} bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
