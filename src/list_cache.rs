//! TTL cache for paginated listing responses
//!
//! Entries expire lazily: a read older than the TTL counts as a miss and the
//! caller repopulates with [`ListCache::set`]. There is no background sweep.
//! Any write to the listed entities clears the whole cache and bumps its
//! generation; a page read before that bump is never stored.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache key for one listing query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListKey {
    pub status: String,
    pub archive: String,
    pub page: u32,
    pub limit: u32,
    pub compact: bool,
}

impl ListKey {
    pub fn new(
        status: impl Into<String>,
        archive: impl Into<String>,
        page: u32,
        limit: u32,
        compact: bool,
    ) -> Self {
        Self {
            status: status.into(),
            archive: archive.into(),
            page,
            limit,
            compact,
        }
    }
}

/// Cached page
#[derive(Debug, Clone)]
pub struct ListEntry<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub cached_at: Instant,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_seconds: u64,
}

/// Listing cache with lazy expiry and hit/miss counters
///
/// Reads take the shared lock; counters are atomics so concurrent readers
/// never serialize on bookkeeping.
#[derive(Debug)]
pub struct ListCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<ListKey, ListEntry<T>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> ListCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a page
    ///
    /// Absent or older than the TTL counts as a miss.
    pub fn get(&self, key: &ListKey) -> Option<ListEntry<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current generation; take it before reading the backing store
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a page read at `generation`, overwriting any previous entry
    ///
    /// Returns `false` without storing if the cache was invalidated since.
    pub fn set(&self, key: ListKey, items: Vec<T>, total: u64, generation: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(
            key,
            ListEntry {
                items,
                total,
                cached_at: Instant::now(),
            },
        );
        true
    }

    /// Drop every entry
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn stats(&self) -> ListCacheStats {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        ListCacheStats {
            entries: entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}
