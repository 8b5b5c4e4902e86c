//! In-memory bookkeeping for the disk cache
//!
//! Reservations, access times, read locks and the eviction index live in one
//! struct so every logical cache operation updates them under a single lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant, SystemTime};

/// Space claimed for an object whose bytes are still arriving
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reservation {
    pub size: u64,
    /// Byte ranges on disk as `start -> end` (exclusive), merged so no two
    /// ranges overlap or touch
    filled: BTreeMap<u64, u64>,
}

impl Reservation {
    fn new(size: u64) -> Self {
        Self {
            size,
            filled: BTreeMap::new(),
        }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.filled.iter().map(|(start, end)| end - start).sum()
    }

    /// End of the run written from offset zero, where an append continues
    pub fn prefix(&self) -> u64 {
        self.filled.get(&0).copied().unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.prefix() == self.size
    }

    /// Whether every byte of `start..end` is already on disk
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.filled
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &filled_end)| filled_end >= end)
    }

    /// Record `start..end` as written
    pub fn fill(&mut self, start: u64, end: u64) {
        let (mut start, mut end) = (start, end);
        let touching: Vec<(u64, u64)> = self
            .filled
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.filled.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.filled.insert(start, end);
    }
}

/// A fully written cache file
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub size: u64,
    pub last_access: SystemTime,
}

/// Active read sequences over one object
#[derive(Debug, Clone, Copy)]
struct ReadLock {
    readers: usize,
    acquired: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    reservations: HashMap<String, Reservation>,
    entries: HashMap<String, Entry>,
    /// Eviction order: oldest access first, ties broken by name
    by_access: BTreeSet<(SystemTime, String)>,
    locks: HashMap<String, ReadLock>,
}

impl CacheState {
    /// Committed bytes plus outstanding reservations
    pub fn usage(&self) -> u64 {
        let committed: u64 = self.entries.values().map(|e| e.size).sum();
        let reserved: u64 = self.reservations.values().map(|r| r.size).sum();
        committed + reserved
    }

    pub fn reservation(&self, id: &str) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub fn reservation_mut(&mut self, id: &str) -> Option<&mut Reservation> {
        self.reservations.get_mut(id)
    }

    pub fn entry(&self, id: &str) -> Option<Entry> {
        self.entries.get(id).copied()
    }

    pub fn reserve(&mut self, id: &str, size: u64) {
        self.remove_entry(id);
        self.reservations
            .insert(id.to_string(), Reservation::new(size));
    }

    pub fn release(&mut self, id: &str) -> Option<Reservation> {
        self.reservations.remove(id)
    }

    /// Turn a finished reservation into an evictable entry
    pub fn commit(&mut self, id: &str, now: SystemTime) -> bool {
        match self.reservations.remove(id) {
            Some(reservation) => {
                self.insert_entry(id, reservation.size, now);
                true
            }
            None => false,
        }
    }

    pub fn insert_entry(&mut self, id: &str, size: u64, last_access: SystemTime) {
        self.remove_entry(id);
        self.entries
            .insert(id.to_string(), Entry { size, last_access });
        self.by_access.insert((last_access, id.to_string()));
    }

    pub fn remove_entry(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.by_access.remove(&(entry.last_access, id.to_string()));
        Some(entry)
    }

    /// Record an access; objects still being written have no entry to move
    pub fn touch(&mut self, id: &str, now: SystemTime) {
        if let Some(entry) = self.entries.get_mut(id) {
            self.by_access.remove(&(entry.last_access, id.to_string()));
            entry.last_access = now;
            self.by_access.insert((now, id.to_string()));
        }
    }

    pub fn lock(&mut self, id: &str, now: Instant) {
        let lock = self.locks.entry(id.to_string()).or_insert(ReadLock {
            readers: 0,
            acquired: now,
        });
        lock.readers += 1;
        lock.acquired = now;
    }

    pub fn unlock(&mut self, id: &str) {
        if let Some(lock) = self.locks.get_mut(id) {
            lock.readers = lock.readers.saturating_sub(1);
            if lock.readers == 0 {
                self.locks.remove(id);
            }
        }
    }

    /// A lock older than `ttl` belongs to a reader that never finished
    pub fn is_locked(&self, id: &str, now: Instant, ttl: Duration) -> bool {
        self.locks
            .get(id)
            .map(|lock| now.duration_since(lock.acquired) < ttl)
            .unwrap_or(false)
    }

    pub fn prune_locks(&mut self, now: Instant, ttl: Duration) {
        self.locks
            .retain(|_, lock| now.duration_since(lock.acquired) < ttl);
    }

    /// Least recently accessed entry without a live read lock
    pub fn eviction_candidate(&self, now: Instant, ttl: Duration) -> Option<String> {
        self.by_access
            .iter()
            .map(|(_, id)| id)
            .find(|id| !self.is_locked(id, now, ttl))
            .cloned()
    }
}
