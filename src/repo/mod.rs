//! Repo Manager Module
//!
//! Orchestrates one layered store: the current memory layer, the published
//! Mapping, and the background Writer, Merger, and LayerCleaner tasks that
//! rotate, flush, compact, and reclaim layers.
//!
//! ## Data Flow
//! ```text
//! apply(update) ──> MemoryLayer ──rotate──> Mapping (memory layer)
//!                                   │
//!                              Writer task
//!                                   ▼
//!                         SortedFile (new generation)
//!                                   │ republish
//!                                   ▼
//!                         Mapping (disk layer) ──┐
//!                                                │ ≥3 adjacent, one size tier
//!                              Merger task <─────┘
//!                                   │ merge + republish
//!                                   ▼
//!                         superseded layers ──> LayerCleaner ──> freed blocks
//! ```
//!
//! ## Concurrency Model
//! - `state` (current memory layer + current mapping + next sequence):
//!   short-held Mutex, never held across I/O
//! - `republish_lock`: serializes mapping transforms so concurrent flush and
//!   merge republishes never lose each other's changes
//! - `merge_selection`: guards the scan-and-mark step of picking layers to
//!   compact; the expensive merge itself runs without it
//! - Background tasks observe the shutdown flag between passes; in-flight
//!   flushes and merges always run to completion

mod tasks;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::block::{BlockStore, CatalogKind, FileBlockStore, StorageSpeed};
use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::mapping::{DiskLayer, LayerHandle, Mapping, View};
use crate::memlayer::{Entry, MemoryLayer, Update};
use crate::sorted::{merge_sorted_files, write_sorted_file, MergeParams, SortedFileSummary};

/// Size-tier bucket for a generation: log₄ of its key count. Generations in
/// the same bucket are candidates for one size-tiered merge.
pub(crate) fn suggest_tier(num_keys: u64) -> u32 {
    (64 - num_keys.max(1).leading_zeros()) / 2
}

// =============================================================================
// Shared Inner State
// =============================================================================

struct RepoState {
    mem: Arc<MemoryLayer>,
    mapping: Arc<Mapping>,
    next_seq: u64,
}

pub(crate) struct RepoInner {
    config: Config,
    store: Arc<dyn BlockStore>,
    store_id: Uuid,
    kind: CatalogKind,
    default_speed: StorageSpeed,

    state: Mutex<RepoState>,
    republish_lock: Mutex<()>,
    merge_selection: Mutex<()>,
    pending_removal: Mutex<Vec<Arc<LayerHandle>>>,

    next_generation: AtomicU64,
    release_up_to: AtomicU64,
    shutdown: AtomicBool,

    write_signal: (Sender<()>, Receiver<()>),
    merge_signal: (Sender<()>, Receiver<()>),
    clean_signal: (Sender<()>, Receiver<()>),
}

impl RepoInner {
    // -------------------------------------------------------------------------
    // Mapping republish
    // -------------------------------------------------------------------------

    /// Build a new Mapping from the current one and swap the current pointer.
    /// The copy runs outside the state lock; only the final swap holds it.
    fn republish(&self, transform: impl FnOnce(&Mapping) -> Arc<Mapping>) {
        let _publish = self.republish_lock.lock();
        let current = Arc::clone(&self.state.lock().mapping);
        let next = transform(&current);
        self.state.lock().mapping = next;
    }

    /// Rotate a non-empty current memory layer into the Mapping and install
    /// a fresh empty one. Returns the rotated layer's handle.
    fn rotate(&self) -> Option<Arc<LayerHandle>> {
        let _publish = self.republish_lock.lock();
        let mut state = self.state.lock();
        if state.mem.is_empty() {
            return None;
        }
        let rotated = LayerHandle::new_memory(Arc::clone(&state.mem), self.default_speed);
        state.mapping = state.mapping.with_appended(Arc::clone(&rotated));
        state.mem = Arc::new(MemoryLayer::with_wake(Some(self.write_signal.0.clone())));
        Some(rotated)
    }

    // -------------------------------------------------------------------------
    // Writer pass
    // -------------------------------------------------------------------------

    /// Rotate, then flush pending memory layers to disk generations. When
    /// enough small pending layers accumulate they are consolidated into a
    /// single generation instead of one file each.
    pub(crate) fn writer_pass(&self) -> Result<()> {
        self.rotate();

        if !self.config.durable {
            // Fast repo: rotated layers stay resident as memory data layers
            return Ok(());
        }

        // Claim pending memory layers, oldest first
        let mapping = Arc::clone(&self.state.lock().mapping);
        let pending: Vec<Arc<LayerHandle>> = mapping
            .layers()
            .iter()
            .filter(|l| l.as_memory().is_some() && !l.is_taken())
            .filter(|l| l.try_take())
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        if pending.len() >= self.config.temp_file_consolidation_threshold {
            self.flush_consolidated(&pending)?;
        } else {
            for handle in &pending {
                self.flush_one(handle)?;
            }
        }

        // Enough disk generations accumulated: schedule the Merger
        let mapping = Arc::clone(&self.state.lock().mapping);
        if mapping.disk_layer_count() >= self.config.merge_trigger {
            let _ = self.merge_signal.0.try_send(());
        }
        Ok(())
    }

    /// Flush one taken memory layer and republish it as a disk layer
    fn flush_one(&self, handle: &Arc<LayerHandle>) -> Result<()> {
        let layer = handle
            .as_memory()
            .ok_or_else(|| StrataError::Corruption("flush of a disk layer".to_string()))?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let summary = write_sorted_file(
            &self.store,
            self.store_id,
            self.kind,
            generation,
            layer,
            handle.flush_speed(),
            self.release_up_to.load(Ordering::Acquire),
        )?;
        let disk = self.disk_handle(&summary, handle.flush_speed());
        self.republish(|m| m.with_replaced(handle, Arc::clone(&disk)));
        // Out of the mapping now; views still holding it only read
        handle.release_taken();
        Ok(())
    }

    /// Combine several small pending layers into one generation
    fn flush_consolidated(&self, pending: &[Arc<LayerHandle>]) -> Result<()> {
        let combined = MemoryLayer::new();
        for handle in pending {
            let layer = handle
                .as_memory()
                .ok_or_else(|| StrataError::Corruption("flush of a disk layer".to_string()))?;
            for entry in layer.walk() {
                combined.insert(entry);
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let speed = pending[0].flush_speed();
        let summary = write_sorted_file(
            &self.store,
            self.store_id,
            self.kind,
            generation,
            &combined,
            speed,
            self.release_up_to.load(Ordering::Acquire),
        )?;
        debug!(
            generation,
            consolidated = pending.len(),
            "consolidated pending memory layers"
        );
        let disk = self.disk_handle(&summary, speed);
        self.republish(|m| m.with_group_replaced(pending, Arc::clone(&disk)));
        for handle in pending {
            handle.release_taken();
        }
        Ok(())
    }

    fn disk_handle(&self, summary: &SortedFileSummary, speed: StorageSpeed) -> Arc<LayerHandle> {
        LayerHandle::new_disk(DiskLayer {
            generation: summary.generation,
            num_keys: summary.num_keys,
            lowest_seq: summary.lowest_seq,
            highest_seq: summary.highest_seq,
            speed,
        })
    }

    // -------------------------------------------------------------------------
    // Merger pass
    // -------------------------------------------------------------------------

    /// One size-tiered compaction step. Returns whether a merge ran.
    pub(crate) fn merger_pass(&self) -> Result<bool> {
        // Selection is guarded so two passes never claim the same layer;
        // the merge itself runs outside the lock.
        let group: Vec<Arc<LayerHandle>> = {
            let _selection = self.merge_selection.lock();
            let mapping = Arc::clone(&self.state.lock().mapping);

            // Only adjacent generations may merge: the output replaces the
            // group in place, so collapsing layers across an intervening
            // newer generation would republish superseded versions ahead of
            // it in read order.
            let mut runs: Vec<Vec<Arc<LayerHandle>>> = Vec::new();
            let mut current: Vec<Arc<LayerHandle>> = Vec::new();
            let mut current_tier: Option<u32> = None;
            for layer in mapping.layers() {
                let tier = match layer.as_disk() {
                    Some(disk) if !layer.is_taken() && !layer.is_marked_for_delete() => {
                        Some(suggest_tier(disk.num_keys))
                    }
                    _ => None,
                };
                if tier.is_some() && tier == current_tier {
                    current.push(Arc::clone(layer));
                } else {
                    if !current.is_empty() {
                        runs.push(std::mem::take(&mut current));
                    }
                    current_tier = tier;
                    if tier.is_some() {
                        current.push(Arc::clone(layer));
                    }
                }
            }
            if !current.is_empty() {
                runs.push(current);
            }

            match runs
                .into_iter()
                .find(|group| group.len() >= self.config.merge_trigger)
            {
                Some(group) => {
                    let claimed: Vec<_> = group.iter().filter(|l| l.try_take()).cloned().collect();
                    if claimed.len() != group.len() {
                        for layer in &claimed {
                            layer.release_taken();
                        }
                        return Ok(false);
                    }
                    claimed
                }
                None => return Ok(false),
            }
        };

        let inputs: Vec<u64> = group
            .iter()
            .filter_map(|l| l.as_disk().map(|d| d.generation))
            .collect();
        self.run_merge(&group, &inputs, MergeParams::standard(self.release_up_to.load(Ordering::Acquire)))?;

        // More tiers may already be ready
        let _ = self.merge_signal.0.try_send(());
        Ok(true)
    }

    /// Tail merge: compact the single oldest disk layer alone, dropping
    /// history and expired tombstones. Safe only for the oldest layer, where
    /// no older generation can resurrect a dropped id.
    pub(crate) fn tail_pass(&self, release_up_to: u64) -> Result<bool> {
        let target: Arc<LayerHandle> = {
            let _selection = self.merge_selection.lock();
            let mapping = Arc::clone(&self.state.lock().mapping);
            match mapping.layers().iter().find(|l| l.as_disk().is_some()) {
                Some(layer)
                    if !layer.is_marked_for_delete()
                        && Arc::ptr_eq(layer, &mapping.layers()[0])
                        && layer.try_take() =>
                {
                    Arc::clone(layer)
                }
                _ => return Ok(false),
            }
        };

        let generation = target.as_disk().map(|d| d.generation).unwrap_or_default();
        let group = [Arc::clone(&target)];
        self.run_merge(&group, &[generation], MergeParams::tail(release_up_to))?;
        Ok(true)
    }

    /// Merge `inputs`, republish the Mapping with the group collapsed into
    /// the new generation, and queue the inputs for reclamation
    fn run_merge(
        &self,
        group: &[Arc<LayerHandle>],
        inputs: &[u64],
        params: MergeParams,
    ) -> Result<()> {
        let output_generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let speed = group[0].flush_speed();
        let summary = merge_sorted_files(
            &self.store,
            self.store_id,
            self.kind,
            output_generation,
            inputs,
            speed,
            params,
            None,
        )?;

        let merged = self.disk_handle(&summary, speed);
        if summary.num_keys == 0 {
            // Every input record expired: publish the removal and queue the
            // entry-less output for reclamation alongside its inputs
            self.republish(|m| m.with_group_removed(group));
            merged.mark_for_delete();
        } else {
            self.republish(|m| m.with_group_replaced(group, Arc::clone(&merged)));
        }

        let mut pending = self.pending_removal.lock();
        if merged.is_marked_for_delete() {
            pending.push(Arc::clone(&merged));
        }
        for layer in group {
            layer.mark_for_delete();
            pending.push(Arc::clone(layer));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // LayerCleaner pass
    // -------------------------------------------------------------------------

    /// Reclaim superseded layers no View references anymore: free their
    /// blocks and drop their catalog entries. Returns layers reclaimed.
    pub(crate) fn cleaner_pass(&self) -> Result<usize> {
        let candidates: Vec<Arc<LayerHandle>> = {
            let mut pending = self.pending_removal.lock();
            std::mem::take(&mut *pending)
        };

        let mut reclaimed = 0usize;
        let mut keep = Vec::new();
        for handle in candidates {
            // The pending list holds the only reference once every Mapping
            // and View that saw this layer has been released
            if !handle.is_marked_for_delete() || Arc::strong_count(&handle) > 1 {
                keep.push(handle);
                continue;
            }

            if let Some(disk) = handle.as_disk() {
                let reader = handle
                    .reader(&self.store, self.store_id)?
                    .ok_or_else(|| StrataError::GenerationNotFound(disk.generation))?;
                let blocks = reader.block_ids().to_vec();
                self.store.free_blocks(&blocks)?;
                self.store.remove_catalog_entry(self.store_id, disk.generation)?;
                debug!(generation = disk.generation, blocks = blocks.len(), "reclaimed generation");
            }
            reclaimed += 1;
        }

        if !keep.is_empty() {
            self.pending_removal.lock().extend(keep);
        }

        // Reader-cache budget: evict oldest layers' readers while resident
        // bytes exceed it
        let mapping = Arc::clone(&self.state.lock().mapping);
        let mut resident: usize = mapping
            .layers()
            .iter()
            .map(|l| l.cached_reader_bytes())
            .sum();
        for layer in mapping.layers() {
            if resident <= self.config.max_cache_size {
                break;
            }
            let bytes = layer.cached_reader_bytes();
            if bytes > 0 {
                layer.evict_reader();
                resident -= bytes;
            }
        }

        Ok(reclaimed)
    }
}

// =============================================================================
// RepoManager
// =============================================================================

/// One layered store: public surface consumed by the layers above
pub struct RepoManager {
    inner: Arc<RepoInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl RepoManager {
    /// Open or create a store backed by a [`FileBlockStore`] under the
    /// configured data directory
    pub fn open(config: Config, store_id: Uuid) -> Result<Self> {
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(&config.data_dir)?);
        Self::open_with_store(config, store, store_id, CatalogKind::DataFile)
    }

    /// Open or create a store over an externally provided block store.
    ///
    /// Restart recovery reconstructs the Mapping purely from the catalog:
    /// live generations sorted oldest-first by their sequence bounds.
    pub fn open_with_store(
        config: Config,
        store: Arc<dyn BlockStore>,
        store_id: Uuid,
        kind: CatalogKind,
    ) -> Result<Self> {
        let mut cataloged = store.list_catalog(store_id, kind)?;
        cataloged.sort_by_key(|e| (e.lowest_seq, e.generation));

        let mut layers = Vec::with_capacity(cataloged.len());
        let mut next_generation = 1u64;
        let mut next_seq = 1u64;
        for entry in &cataloged {
            next_generation = next_generation.max(entry.generation + 1);
            next_seq = next_seq.max(entry.highest_seq + 1);
            layers.push(LayerHandle::new_disk(DiskLayer {
                generation: entry.generation,
                num_keys: entry.num_keys,
                lowest_seq: entry.lowest_seq,
                highest_seq: entry.highest_seq,
                speed: StorageSpeed::Fast,
            }));
        }

        if !cataloged.is_empty() {
            info!(
                store = %store_id,
                generations = cataloged.len(),
                next_seq,
                "recovered store from catalog"
            );
        }

        let write_signal = channel::bounded(1);
        let merge_signal = channel::bounded(1);
        let clean_signal = channel::bounded(1);

        let mem = Arc::new(MemoryLayer::with_wake(Some(write_signal.0.clone())));
        let inner = Arc::new(RepoInner {
            config,
            store,
            store_id,
            kind,
            default_speed: StorageSpeed::Fast,
            state: Mutex::new(RepoState {
                mem,
                mapping: Mapping::from_layers(layers),
                next_seq,
            }),
            republish_lock: Mutex::new(()),
            merge_selection: Mutex::new(()),
            pending_removal: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(next_generation),
            release_up_to: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            write_signal,
            merge_signal,
            clean_signal,
        });

        let tasks = tasks::spawn_all(&inner)?;
        Ok(Self { inner, tasks })
    }

    // -------------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------------

    /// Apply a multi-key update under one freshly assigned sequence number.
    /// Returns the assigned sequence number.
    pub fn apply(&self, update: Update) -> Result<u64> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(StrataError::Shutdown);
        }
        if update.diffs.iter().any(|(id, _)| id.is_nil()) {
            return Err(StrataError::Corruption(
                "nil uuid is reserved as the hash sentinel".to_string(),
            ));
        }

        // The inserts must land in the layer the sequence number was
        // assigned against: releasing the state lock first would let a
        // concurrent rotation claim and flush `mem` without them
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        for (id, payload) in update.diffs {
            state.mem.insert(Entry {
                id,
                seq,
                deadline_count: update.deadline_count,
                payload,
            });
        }
        Ok(seq)
    }

    /// Ingest a pre-built memory layer (bootstrap / replication). The layer
    /// joins the Mapping immediately; the Writer flushes it in the background.
    pub fn add_import_layer(&self, layer: MemoryLayer, speed: StorageSpeed) {
        let imported_high = layer.highest_seq();
        let handle = LayerHandle::new_memory(Arc::new(layer), speed);
        self.inner.republish(|m| m.with_appended(Arc::clone(&handle)));
        if let Some(high) = imported_high {
            // Imported layers carry source-assigned sequence numbers; local
            // assignment must stay above them
            let mut state = self.inner.state.lock();
            state.next_seq = state.next_seq.max(high + 1);
        }
        let _ = self.inner.write_signal.0.try_send(());
    }

    /// Set the sequence watermark below which superseded versions may be
    /// physically dropped by future merges
    pub fn set_release_watermark(&self, seq: u64) {
        self.inner.release_up_to.store(seq, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// Capture a consistent snapshot under one lock acquisition
    pub fn new_view(&self) -> View {
        let state = self.inner.state.lock();
        let highest = state.next_seq.saturating_sub(1);
        let lowest = state
            .mapping
            .lowest_seq()
            .or_else(|| state.mem.lowest_seq())
            .unwrap_or(state.next_seq);
        View::new(
            Arc::clone(&self.inner.store),
            self.inner.store_id,
            Arc::clone(&state.mapping),
            Arc::clone(&state.mem),
            lowest,
            highest,
            state.next_seq,
        )
    }

    // -------------------------------------------------------------------------
    // Explicit compaction triggers (orchestration outside the core)
    // -------------------------------------------------------------------------

    /// Rotate and flush the current memory layer now
    pub fn step_merge_mem(&self) -> Result<()> {
        self.inner.writer_pass()
    }

    /// Run one size-tiered disk merge now. Returns whether a merge ran.
    pub fn step_merge_disk(&self) -> Result<bool> {
        self.inner.merger_pass()
    }

    /// Tail-merge the oldest disk generation now, dropping history and
    /// tombstones below `release_up_to`. Returns whether it ran.
    pub fn step_tail(&self, release_up_to: u64) -> Result<bool> {
        self.inner.tail_pass(release_up_to)
    }

    /// Run one reclamation pass now. Returns layers reclaimed.
    pub fn step_clean(&self) -> Result<usize> {
        self.inner.cleaner_pass()
    }

    /// Force a rotate-and-flush (alias used by callers that think in terms
    /// of flushing rather than compaction stepping)
    pub fn flush(&self) -> Result<()> {
        self.inner.writer_pass()
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Number of disk generations in the current mapping
    pub fn disk_layer_count(&self) -> usize {
        self.inner.state.lock().mapping.disk_layer_count()
    }

    /// Number of pending (rotated, unflushed) memory layers
    pub fn memory_layer_count(&self) -> usize {
        self.inner.state.lock().mapping.memory_layer_count()
    }

    /// The store identifier
    pub fn store_id(&self) -> Uuid {
        self.inner.store_id
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop background tasks. In-flight flushes and merges complete; the
    /// shutdown flag is only observed between passes.
    pub fn shutdown(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.write_signal.0.try_send(());
        let _ = self.inner.merge_signal.0.try_send(());
        let _ = self.inner.clean_signal.0.try_send(());
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
    }
}

impl Drop for RepoManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_buckets_grow_by_factor_four() {
        assert_eq!(suggest_tier(2), suggest_tier(7));
        assert_ne!(suggest_tier(7), suggest_tier(8));
        assert_eq!(suggest_tier(8), suggest_tier(31));
        assert!(suggest_tier(100) < suggest_tier(1000));
    }

    /// Inner state without spawned tasks, so passes run only when called
    fn bare_inner(config: Config) -> Arc<RepoInner> {
        let store: Arc<dyn BlockStore> =
            Arc::new(FileBlockStore::open(&config.data_dir).unwrap());
        Arc::new(RepoInner {
            config,
            store,
            store_id: Uuid::new_v4(),
            kind: CatalogKind::DataFile,
            default_speed: StorageSpeed::Fast,
            state: Mutex::new(RepoState {
                mem: Arc::new(MemoryLayer::new()),
                mapping: Mapping::from_layers(Vec::new()),
                next_seq: 1,
            }),
            republish_lock: Mutex::new(()),
            merge_selection: Mutex::new(()),
            pending_removal: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            release_up_to: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            write_signal: channel::bounded(1),
            merge_signal: channel::bounded(1),
            clean_signal: channel::bounded(1),
        })
    }

    fn insert_one(inner: &RepoInner, seq: u64) {
        inner.state.lock().mem.insert(Entry {
            id: Uuid::new_v4(),
            seq,
            deadline_count: u64::MAX,
            payload: Some(bytes::Bytes::from_static(b"v")),
        });
    }

    #[test]
    fn flush_releases_the_rotated_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let inner = bare_inner(Config::builder().data_dir(dir.path()).durable(true).build());

        insert_one(&inner, 1);
        let rotated = inner.rotate().unwrap();
        inner.writer_pass().unwrap();

        assert!(!rotated.is_taken());
        assert_eq!(inner.state.lock().mapping.memory_layer_count(), 0);
        assert_eq!(inner.state.lock().mapping.disk_layer_count(), 1);
    }

    #[test]
    fn consolidated_flush_releases_every_rotated_handle() {
        let dir = tempfile::TempDir::new().unwrap();
        let inner = bare_inner(
            Config::builder()
                .data_dir(dir.path())
                .durable(true)
                .temp_file_consolidation_threshold(2)
                .build(),
        );

        let mut rotated = Vec::new();
        for seq in 1..=2u64 {
            insert_one(&inner, seq);
            rotated.push(inner.rotate().unwrap());
        }
        inner.writer_pass().unwrap();

        for handle in &rotated {
            assert!(!handle.is_taken());
        }
        assert_eq!(inner.state.lock().mapping.memory_layer_count(), 0);
        assert_eq!(inner.state.lock().mapping.disk_layer_count(), 1);
    }
}
