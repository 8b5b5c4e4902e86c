//! Chunk layout and byte-range math
//!
//! Every plaintext chunk of up to [`CHUNK_SIZE`] bytes is encrypted on its own,
//! adding [`TOTAL_OVERHEAD`] bytes (12 byte IV + 16 byte tag). Chunk indices are
//! 1-based and map deterministically onto ranges of the stored ciphertext.

/// Plaintext bytes per chunk (10 MB)
pub const CHUNK_SIZE: u64 = 10_000_000;

/// Encryption overhead added to every chunk: tag (16) + IV (12)
pub const TOTAL_OVERHEAD: u64 = 28;

/// Inclusive byte range of one stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub start: u64,
    /// Inclusive end offset
    pub end: u64,
    /// This range reaches the last byte of the object
    pub eof: bool,
}

impl ReadRange {
    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Chunk size and overhead shared by encoder and reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub overhead: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            overhead: TOTAL_OVERHEAD,
        }
    }
}

impl ChunkLayout {
    pub fn new(chunk_size: u64, overhead: u64) -> Self {
        Self {
            chunk_size,
            overhead,
        }
    }

    /// Stored size of a full chunk
    pub fn stored_chunk_size(&self) -> u64 {
        self.chunk_size + self.overhead
    }

    /// Number of chunks needed for `plaintext_len` bytes
    pub fn num_chunks(&self, plaintext_len: u64) -> u64 {
        plaintext_len.div_ceil(self.chunk_size)
    }

    /// Number of chunks in an already-encrypted stream of `stored_len` bytes
    pub fn num_chunks_stored(&self, stored_len: u64) -> u64 {
        stored_len.div_ceil(self.stored_chunk_size())
    }

    /// Total ciphertext length produced for `plaintext_len` bytes
    pub fn stored_len(&self, plaintext_len: u64) -> u64 {
        plaintext_len + self.num_chunks(plaintext_len) * self.overhead
    }

    /// Byte range holding chunk `chunk` of an object `length` bytes long
    ///
    /// Index 0 is treated as 1 since reads always begin at the first chunk.
    /// Returns `None` when the chunk starts past the end of the object.
    /// Indices large enough to overflow the offset math also yield `None`.
    pub fn read_boundaries(&self, chunk: u64, length: u64) -> Option<ReadRange> {
        let index = chunk.max(1) - 1;
        let stride = self.chunk_size.checked_add(self.overhead)?;
        let start = index.checked_mul(stride)?;
        if length == 0 || start >= length {
            return None;
        }

        let mut end = start.saturating_add(stride.saturating_sub(1));
        let mut eof = false;
        if end >= length - 1 {
            end = length - 1;
            eof = true;
        }

        Some(ReadRange { start, end, eof })
    }
}

/// One chunk of ciphertext in transit
///
/// Exists only for the duration of a single upload call.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub file_id: String,
    pub filename: String,
    pub data: Vec<u8>,
    /// 1-based chunk index
    pub chunk_num: u64,
    pub total_chunks: u64,
}

/// Hex SHA-1 digest of `data`, as expected by the B2 API
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
