//! MemoryLayer implementation
//!
//! BTreeMap-based layer with RwLock for concurrency; size and sequence
//! bounds tracked with atomics so readers never take the write lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::channel::Sender;
use parking_lot::RwLock;
use uuid::Uuid;

use super::Entry;

/// In-memory layer of pending writes
///
/// ## Concurrency:
/// - `data`: RwLock (many concurrent readers, exclusive writer)
/// - counters and sequence bounds: atomics (lock-free reads)
/// - All methods use `&self`; ownership of the layer as a whole is managed
///   by the RepoManager (exclusive until rotated, then frozen)
pub struct MemoryLayer {
    /// id → entries for that id, newest (highest seq) first
    data: RwLock<BTreeMap<Uuid, Vec<Entry>>>,

    /// Total persisted-record bytes of all entries
    bytes: AtomicUsize,

    /// Total entry count (all versions)
    entry_count: AtomicUsize,

    /// Lowest sequence number inserted (u64::MAX while empty)
    lowest_seq: AtomicU64,

    /// Highest sequence number inserted (0 while empty)
    highest_seq: AtomicU64,

    /// Writer wakeup: signalled when an insert lands in an empty layer.
    /// Bounded(1) channel used as a counting semaphore; a full channel means
    /// the Writer is already scheduled.
    wake: Option<Sender<()>>,
}

impl MemoryLayer {
    /// Create an empty layer with no Writer signal (imports, tests)
    pub fn new() -> Self {
        Self::with_wake(None)
    }

    /// Create an empty layer that signals `wake` on first insert
    pub fn with_wake(wake: Option<Sender<()>>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            bytes: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            lowest_seq: AtomicU64::new(u64::MAX),
            highest_seq: AtomicU64::new(0),
            wake,
        }
    }

    /// Insert an entry. Callers must not insert after the layer has been
    /// handed to a flush.
    pub fn insert(&self, entry: Entry) {
        let was_empty;
        {
            let mut data = self.data.write();
            was_empty = data.is_empty();

            self.bytes.fetch_add(entry.record_size() as usize, Ordering::Relaxed);
            self.entry_count.fetch_add(1, Ordering::Relaxed);
            self.lowest_seq.fetch_min(entry.seq, Ordering::Relaxed);
            self.highest_seq.fetch_max(entry.seq, Ordering::Relaxed);

            // Newest-first per id. Repo inserts always arrive in ascending
            // seq order (position 0); consolidation replays go anywhere.
            let versions = data.entry(entry.id).or_default();
            let pos = versions
                .iter()
                .position(|e| e.seq < entry.seq)
                .unwrap_or(versions.len());
            versions.insert(pos, entry);
        }

        // Insertion into an empty layer schedules rotation proactively
        if was_empty {
            if let Some(wake) = &self.wake {
                let _ = wake.try_send(());
            }
        }
    }

    /// Highest-sequence entry for `id`, if present in this layer
    pub fn find_max(&self, id: &Uuid) -> Option<Entry> {
        self.data.read().get(id).and_then(|v| v.first().cloned())
    }

    /// Highest-sequence entry for `id` with `seq <= max_seq`. Views use this
    /// against the live memory layer so writes after capture stay invisible.
    pub fn find_max_bounded(&self, id: &Uuid, max_seq: u64) -> Option<Entry> {
        self.data
            .read()
            .get(id)
            .and_then(|v| v.iter().find(|e| e.seq <= max_seq).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count.load(Ordering::Relaxed) == 0
    }

    /// Total entry count (all versions)
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Number of distinct ids
    pub fn num_keys(&self) -> usize {
        self.data.read().len()
    }

    /// Approximate persisted size in bytes
    pub fn size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Lowest sequence number in the layer (None while empty)
    pub fn lowest_seq(&self) -> Option<u64> {
        match self.lowest_seq.load(Ordering::Relaxed) {
            u64::MAX => None,
            seq => Some(seq),
        }
    }

    /// Highest sequence number in the layer (None while empty)
    pub fn highest_seq(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.highest_seq.load(Ordering::Relaxed))
        }
    }

    /// One id-ordered walk of the layer: entries ascending by id, and within
    /// an id descending by sequence number. Used by the SortedFile writer.
    pub fn walk(&self) -> Vec<Entry> {
        let data = self.data.read();
        let mut out = Vec::with_capacity(self.entry_count.load(Ordering::Relaxed));
        for versions in data.values() {
            out.extend(versions.iter().cloned());
        }
        out
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
