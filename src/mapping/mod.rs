//! Mapping / View Module
//!
//! MVCC over layers: an immutable, reference-counted, ordered list of data
//! layers published atomically. Readers acquire a View (mapping + current
//! memory layer + sequence bounds) under one lock acquisition and observe a
//! fixed layer set for the View's whole lifetime, regardless of concurrent
//! flushes and merges.
//!
//! ## Layer Lifecycle
//! ```text
//! Active ──> Taken ──> Superseded ──> Reclaimable ──> Destroyed
//!            (claimed by one        (marked_for_delete,
//!             in-flight flush        awaiting zero
//!             or merge)              references)
//! ```
//! Reference counting maps to `Arc`: a superseded layer becomes reclaimable
//! once the pending-removal list holds the last strong reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::block::{BlockStore, StorageSpeed};
use crate::error::Result;
use crate::memlayer::{Entry, MemoryLayer};
use crate::sorted::SortedFileReader;

// =============================================================================
// Data Layers
// =============================================================================

/// Metadata of one on-disk generation layer
#[derive(Debug, Clone, Copy)]
pub struct DiskLayer {
    pub generation: u64,
    pub num_keys: u64,
    pub lowest_seq: u64,
    pub highest_seq: u64,
    pub speed: StorageSpeed,
}

/// The two layer representations
pub enum LayerKind {
    /// A rotated (or imported) memory layer not yet flushed, or kept
    /// resident permanently for non-durable repos
    Memory(Arc<MemoryLayer>),
    /// An immutable on-disk generation
    Disk(DiskLayer),
}

/// One data layer plus its lifecycle flags
pub struct LayerHandle {
    kind: LayerKind,
    /// Storage tier a flush of this layer should target (memory layers only)
    flush_speed: StorageSpeed,
    /// Exclusively claimed by one in-flight flush/merge
    taken: AtomicBool,
    /// Physically superseded, awaiting zero-reference reclamation
    marked_for_delete: AtomicBool,
    /// Lazily opened reader for disk layers, shared by all lookups
    reader: Mutex<Option<Arc<SortedFileReader>>>,
}

impl LayerHandle {
    pub fn new_memory(layer: Arc<MemoryLayer>, flush_speed: StorageSpeed) -> Arc<Self> {
        Arc::new(Self {
            kind: LayerKind::Memory(layer),
            flush_speed,
            taken: AtomicBool::new(false),
            marked_for_delete: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn new_disk(disk: DiskLayer) -> Arc<Self> {
        Arc::new(Self {
            flush_speed: disk.speed,
            kind: LayerKind::Disk(disk),
            taken: AtomicBool::new(false),
            marked_for_delete: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn as_memory(&self) -> Option<&Arc<MemoryLayer>> {
        match &self.kind {
            LayerKind::Memory(layer) => Some(layer),
            LayerKind::Disk(_) => None,
        }
    }

    pub fn as_disk(&self) -> Option<&DiskLayer> {
        match &self.kind {
            LayerKind::Memory(_) => None,
            LayerKind::Disk(disk) => Some(disk),
        }
    }

    pub fn flush_speed(&self) -> StorageSpeed {
        self.flush_speed
    }

    pub fn num_keys(&self) -> u64 {
        match &self.kind {
            LayerKind::Memory(layer) => layer.num_keys() as u64,
            LayerKind::Disk(disk) => disk.num_keys,
        }
    }

    pub fn lowest_seq(&self) -> Option<u64> {
        match &self.kind {
            LayerKind::Memory(layer) => layer.lowest_seq(),
            LayerKind::Disk(disk) => Some(disk.lowest_seq),
        }
    }

    pub fn highest_seq(&self) -> Option<u64> {
        match &self.kind {
            LayerKind::Memory(layer) => layer.highest_seq(),
            LayerKind::Disk(disk) => Some(disk.highest_seq),
        }
    }

    /// Claim this layer for an in-flight flush/merge. Only one claimant
    /// succeeds until `release_taken`.
    pub fn try_take(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_taken(&self) {
        self.taken.store(false, Ordering::Release);
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    pub fn mark_for_delete(&self) {
        self.marked_for_delete.store(true, Ordering::Release);
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete.load(Ordering::Acquire)
    }

    /// Open (or reuse) the reader for a disk layer. Memory layers have no
    /// reader and return None.
    pub fn reader(&self, store: &Arc<dyn BlockStore>, store_id: Uuid) -> Result<Option<Arc<SortedFileReader>>> {
        let disk = match self.as_disk() {
            Some(disk) => disk,
            None => return Ok(None),
        };
        let mut cached = self.reader.lock();
        if cached.is_none() {
            let reader = SortedFileReader::open(Arc::clone(store), store_id, disk.generation)?;
            *cached = Some(Arc::new(reader));
        }
        Ok(cached.clone())
    }

    /// Approximate resident bytes of the cached reader, 0 when none is open
    pub fn cached_reader_bytes(&self) -> usize {
        self.reader
            .lock()
            .as_ref()
            .map(|r| r.resident_bytes())
            .unwrap_or(0)
    }

    /// Drop the cached reader; the next lookup reopens it
    pub fn evict_reader(&self) {
        *self.reader.lock() = None;
    }

    /// Highest-sequence entry for `id` in this layer
    pub fn find_max(
        &self,
        store: &Arc<dyn BlockStore>,
        store_id: Uuid,
        id: &Uuid,
    ) -> Result<Option<Entry>> {
        match &self.kind {
            LayerKind::Memory(layer) => Ok(layer.find_max(id)),
            LayerKind::Disk(_) => match self.reader(store, store_id)? {
                Some(reader) => reader.find_in_hash(id),
                None => Ok(None),
            },
        }
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// Immutable ordered list of layers, oldest first. A new Mapping is always
/// built by copying an existing one's layer list with one transform applied;
/// only the repo's current-mapping pointer ever changes.
pub struct Mapping {
    layers: Vec<Arc<LayerHandle>>,
}

impl Mapping {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self { layers: Vec::new() })
    }

    pub fn from_layers(layers: Vec<Arc<LayerHandle>>) -> Arc<Self> {
        Arc::new(Self { layers })
    }

    /// Layers oldest → newest
    pub fn layers(&self) -> &[Arc<LayerHandle>] {
        &self.layers
    }

    pub fn disk_layer_count(&self) -> usize {
        self.layers.iter().filter(|l| l.as_disk().is_some()).count()
    }

    pub fn memory_layer_count(&self) -> usize {
        self.layers.iter().filter(|l| l.as_memory().is_some()).count()
    }

    /// Copy with `layer` appended as the newest layer
    pub fn with_appended(&self, layer: Arc<LayerHandle>) -> Arc<Self> {
        let mut layers = self.layers.clone();
        layers.push(layer);
        Arc::new(Self { layers })
    }

    /// Copy with `target` replaced in place by `replacement`
    pub fn with_replaced(
        &self,
        target: &Arc<LayerHandle>,
        replacement: Arc<LayerHandle>,
    ) -> Arc<Self> {
        let layers = self
            .layers
            .iter()
            .map(|l| {
                if Arc::ptr_eq(l, target) {
                    Arc::clone(&replacement)
                } else {
                    Arc::clone(l)
                }
            })
            .collect();
        Arc::new(Self { layers })
    }

    /// Copy with `target` removed
    pub fn with_removed(&self, target: &Arc<LayerHandle>) -> Arc<Self> {
        let layers = self
            .layers
            .iter()
            .filter(|l| !Arc::ptr_eq(l, target))
            .cloned()
            .collect();
        Arc::new(Self { layers })
    }

    /// Copy with a group of layers removed (merge whose output is empty)
    pub fn with_group_removed(&self, group: &[Arc<LayerHandle>]) -> Arc<Self> {
        let layers = self
            .layers
            .iter()
            .filter(|l| !group.iter().any(|g| Arc::ptr_eq(g, l)))
            .cloned()
            .collect();
        Arc::new(Self { layers })
    }

    /// Copy with a group of layers collapsed into one replacement, placed at
    /// the position of the oldest group member (merge republish)
    pub fn with_group_replaced(
        &self,
        group: &[Arc<LayerHandle>],
        replacement: Arc<LayerHandle>,
    ) -> Arc<Self> {
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut placed = false;
        for layer in &self.layers {
            if group.iter().any(|g| Arc::ptr_eq(g, layer)) {
                if !placed {
                    layers.push(Arc::clone(&replacement));
                    placed = true;
                }
            } else {
                layers.push(Arc::clone(layer));
            }
        }
        Arc::new(Self { layers })
    }

    /// Lowest sequence number covered by any layer
    pub fn lowest_seq(&self) -> Option<u64> {
        self.layers.iter().filter_map(|l| l.lowest_seq()).min()
    }
}

// =============================================================================
// View
// =============================================================================

/// A caller-held snapshot: mapping + current memory layer + sequence bounds,
/// captured under one lock acquisition. Holding a View pins every referenced
/// layer; releasing is dropping it.
pub struct View {
    store: Arc<dyn BlockStore>,
    store_id: Uuid,
    mapping: Arc<Mapping>,
    mem: Arc<MemoryLayer>,
    lowest_seq: u64,
    highest_seq: u64,
    next_seq: u64,
}

impl View {
    pub(crate) fn new(
        store: Arc<dyn BlockStore>,
        store_id: Uuid,
        mapping: Arc<Mapping>,
        mem: Arc<MemoryLayer>,
        lowest_seq: u64,
        highest_seq: u64,
        next_seq: u64,
    ) -> Self {
        Self {
            store,
            store_id,
            mapping,
            mem,
            lowest_seq,
            highest_seq,
            next_seq,
        }
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Lower sequence bound observed by this view
    pub fn lowest_seq(&self) -> u64 {
        self.lowest_seq
    }

    /// Upper sequence bound observed by this view
    pub fn highest_seq(&self) -> u64 {
        self.highest_seq
    }

    /// Next-sequence watermark at capture time
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Newest entry for `id` visible in this snapshot: memory layer first,
    /// then mapping layers newest → oldest. Tombstones are returned as
    /// entries (payload None); absence means the id was never written.
    ///
    /// The live memory layer keeps absorbing writes after capture, so its
    /// lookup is bounded by the view's upper sequence bound. Mapping layers
    /// are frozen at capture and need no bound.
    pub fn find(&self, id: &Uuid) -> Result<Option<Entry>> {
        if let Some(entry) = self.mem.find_max_bounded(id, self.highest_seq) {
            return Ok(Some(entry));
        }
        for layer in self.mapping.layers().iter().rev() {
            if let Some(entry) = layer.find_max(&self.store, self.store_id, id)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Newest live payload for `id`: None for missing ids and tombstones
    pub fn load(&self, id: &Uuid) -> Result<Option<bytes::Bytes>> {
        Ok(self.find(id)?.and_then(|e| e.payload))
    }
}
