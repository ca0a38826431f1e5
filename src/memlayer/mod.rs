//! Memory Layer Module
//!
//! In-memory sorted collection of pending writes, ordered by id, every write
//! stamped with a monotonic sequence number.
//!
//! ## Responsibilities
//! - Absorb high-rate writes before they are durable
//! - Serve point lookups for the newest version of an id
//! - Signal the Writer task when the first write lands in an empty layer
//! - Hand a single id-ordered walk to the SortedFile writer at flush time
//!
//! ## Data Structure Choice
//! BTreeMap keyed by id, each slot holding that id's entries newest-first.
//! Sequence numbers are repo-monotonic, so within one layer a later insert
//! for the same id always carries a higher sequence number.

mod layer;

use bytes::Bytes;
use uuid::Uuid;

pub use layer::MemoryLayer;

/// A single versioned write.
///
/// `payload: None` is the tombstone marker. The entry with the highest
/// sequence number for an id is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: Uuid,
    pub seq: u64,
    pub deadline_count: u64,
    pub payload: Option<Bytes>,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Byte size of this entry's persisted record
    pub fn record_size(&self) -> u64 {
        crate::sorted::ENTRY_FIXED_SIZE
            + self.payload.as_ref().map(|p| p.len() as u64).unwrap_or(0)
    }
}

/// A multi-key diff applied atomically under one sequence number
#[derive(Debug, Clone)]
pub struct Update {
    pub deadline_count: u64,
    pub diffs: Vec<(Uuid, Option<Bytes>)>,
}

impl Update {
    /// Single-key write
    pub fn put(id: Uuid, deadline_count: u64, payload: Bytes) -> Self {
        Self {
            deadline_count,
            diffs: vec![(id, Some(payload))],
        }
    }

    /// Single-key tombstone
    pub fn delete(id: Uuid, deadline_count: u64) -> Self {
        Self {
            deadline_count,
            diffs: vec![(id, None)],
        }
    }
}
