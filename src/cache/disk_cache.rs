//! Local Disk Cache
//!
//! Keeps recently downloaded objects on local disk, one file per object ID,
//! within a hard capacity budget. Space is reserved before an object's bytes
//! arrive so concurrent downloads cannot overcommit the cache, and the least
//! recently read unlocked file is evicted to make room.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use super::state::CacheState;
use super::CacheError;
use crate::chunks::CHUNK_SIZE;
use crate::config::CacheConfig;

/// On-disk cache of whole objects keyed by file ID
pub struct DiskCache {
    config: CacheConfig,
    /// Reads shorter than this past offset zero end a read sequence
    chunk_size: u64,
    state: Mutex<CacheState>,
}

impl DiskCache {
    /// Open the cache described by `config`, indexing files left by earlier runs
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let cache = Self {
            config,
            chunk_size: CHUNK_SIZE,
            state: Mutex::new(CacheState::default()),
        };
        if !cache.config.enabled {
            debug!("File cache disabled");
            return Ok(cache);
        }

        fs::create_dir_all(&cache.config.dir)?;
        cache.load_index()?;

        info!(
            cache_dir = %cache.config.dir.display(),
            max_size_mb = cache.config.max_size / (1024 * 1024),
            max_file_size_mb = cache.config.max_file_size / (1024 * 1024),
            used_bytes = cache.usage(),
            "File cache initialized"
        );
        Ok(cache)
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            config: CacheConfig::disabled(PathBuf::new()),
            chunk_size: CHUNK_SIZE,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Override the read-sequence chunk size (tests use small objects)
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Bytes held by committed files plus outstanding reservations
    pub fn usage(&self) -> u64 {
        self.state().usage()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let safe = id.replace(['/', '\\', ':'], "_");
        self.config.dir.join(safe)
    }

    fn usable(&self, id: &str) -> bool {
        self.config.enabled && !id.is_empty()
    }

    /// Seed the eviction index from files already on disk, oldest mtime first
    fn load_index(&self) -> Result<(), CacheError> {
        let mut state = self.state();
        for dir_entry in fs::read_dir(&self.config.dir)?.flatten() {
            let metadata = match dir_entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            state.insert_entry(&name, metadata.len(), modified);
        }
        Ok(())
    }

    /// Reserve `declared_size` bytes for `id`, evicting old files as needed
    ///
    /// Returns whether a reservation is now held. Objects over either size
    /// cap, or that cannot be fit after evicting every unlocked file, are
    /// simply not cached.
    pub fn prep_cache(&self, id: &str, declared_size: u64) -> bool {
        if !self.usable(id)
            || declared_size > self.config.max_file_size
            || declared_size > self.config.max_size
        {
            return false;
        }

        let mut state = self.state();
        if state.reservation(id).is_some() {
            // Another download of this object is already filling it
            return false;
        }

        // A stale or partial copy is replaced, and its bytes no longer count
        if state.remove_entry(id).is_some() {
            remove_if_exists(&self.path_for(id));
        }

        let now = Instant::now();
        state.prune_locks(now, self.config.read_lock_ttl);
        while state.usage() + declared_size > self.config.max_size {
            if self.remove_oldest_unlocked_file(&mut state, now).is_none() {
                debug!(
                    file_id = id,
                    size = declared_size,
                    used = state.usage(),
                    "Unable to free cache space, skipping cache"
                );
                return false;
            }
        }

        remove_if_exists(&self.path_for(id));
        state.reserve(id, declared_size);
        debug!(file_id = id, size = declared_size, "Reserved cache space");
        true
    }

    /// Evict the least recently read file that is not locked by a reader
    fn remove_oldest_unlocked_file(&self, state: &mut CacheState, now: Instant) -> Option<String> {
        let id = state.eviction_candidate(now, self.config.read_lock_ttl)?;
        let entry = state.remove_entry(&id)?;
        remove_if_exists(&self.path_for(&id));
        info!(file_id = %id, size = entry.size, "Evicted cached file");
        Some(id)
    }

    /// True only if the cached copy exists with exactly `expected_len` bytes
    pub fn has_file(&self, id: &str, expected_len: u64) -> bool {
        if !self.usable(id) {
            return false;
        }
        if self.state().reservation(id).is_some() {
            return false;
        }
        match fs::metadata(self.path_for(id)) {
            Ok(metadata) => metadata.is_file() && metadata.len() == expected_len,
            Err(_) => false,
        }
    }

    /// Append to a reserved object
    pub fn write(&self, id: &str, data: &[u8]) -> Result<(), CacheError> {
        let offset = match self.state().reservation(id) {
            Some(reservation) => reservation.prefix(),
            None => return Ok(()),
        };
        self.write_at(id, offset, data)
    }

    /// Write `data` at `offset` of a reserved object
    ///
    /// Ranges may arrive in any order and more than once. The object becomes
    /// readable once every byte of the declared size has been written. A
    /// write past the declared size abandons the reservation.
    pub fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), CacheError> {
        if !self.usable(id) || data.is_empty() {
            return Ok(());
        }
        let path = self.path_for(id);
        let end = offset.saturating_add(data.len() as u64);

        {
            let mut state = self.state();
            let reservation = match state.reservation(id) {
                Some(r) => r,
                None => return Ok(()),
            };
            if end > reservation.size {
                debug!(
                    file_id = id,
                    offset = offset,
                    len = data.len(),
                    size = reservation.size,
                    "Cache write past declared size, abandoning reservation"
                );
                state.release(id);
                remove_if_exists(&path);
                return Ok(());
            }
            if reservation.covers(offset, end) {
                return Ok(());
            }
        }

        if let Err(e) = write_file_at(&path, offset, data) {
            self.state().release(id);
            remove_if_exists(&path);
            return Err(e.into());
        }

        // Ranges are recorded only once their bytes are on disk, so a
        // complete reservation never points at unwritten data
        let mut state = self.state();
        let (written, complete) = match state.reservation_mut(id) {
            Some(reservation) => {
                reservation.fill(offset, end);
                (reservation.written(), reservation.is_complete())
            }
            None => {
                // Reservation was dropped while writing
                remove_if_exists(&path);
                return Ok(());
            }
        };
        if complete {
            state.commit(id, SystemTime::now());
            debug!(file_id = id, size = written, "Cached file complete");
        } else {
            debug!(file_id = id, offset = offset, written = written, "Cached range");
        }
        Ok(())
    }

    /// Read `start..=end` of a cached object, or the whole object if `end` is None
    ///
    /// A read from offset zero that does not cover the whole object starts a
    /// read sequence and locks the object against eviction. The lock is
    /// released by a later read that reaches the end of the object or is
    /// shorter than one chunk.
    pub fn read(&self, id: &str, start: u64, end: Option<u64>) -> Result<Vec<u8>, CacheError> {
        if !self.usable(id) {
            return Err(CacheError::Disabled);
        }
        let path = self.path_for(id);

        let size = {
            let mut state = self.state();
            if state.reservation(id).is_some() {
                return Err(CacheError::NotCached(id.to_string()));
            }
            let size = match fs::metadata(&path) {
                Ok(m) if m.is_file() => m.len(),
                Ok(_) => return Err(CacheError::NotCached(id.to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CacheError::NotCached(id.to_string()));
                }
                Err(e) => return Err(e.into()),
            };
            if state.entry(id).is_none() {
                state.insert_entry(id, size, SystemTime::now());
            }

            let last = size.saturating_sub(1);
            let reaches_end = end.map_or(true, |e| e >= last);
            if start == 0 && !reaches_end {
                state.lock(id, Instant::now());
            } else if start > 0 {
                let span = end.unwrap_or(last).saturating_sub(start);
                if reaches_end || span < self.chunk_size {
                    state.unlock(id);
                }
            }
            state.touch(id, SystemTime::now());
            size
        };

        let data = match end {
            None => fs::read(&path)?,
            Some(end) => {
                if end < start || end >= size {
                    return Err(CacheError::OutOfRange { start, end, size });
                }
                let mut file = File::open(&path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; (end - start + 1) as usize];
                file.read_exact(&mut buf)?;
                buf
            }
        };

        debug!(file_id = id, start = start, size = data.len(), "Cache read");
        Ok(data)
    }

    /// Remove a cached object; a missing file is not an error
    pub fn remove_file(&self, id: &str) -> Result<(), CacheError> {
        if !self.usable(id) {
            return Ok(());
        }
        let mut state = self.state();
        state.release(id);
        state.remove_entry(id);
        state.unlock(id);
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_file_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cached file");
        }
    }
}
