//! MergeFile Compaction Path
//!
//! K-way merges N existing SortedFiles into one new SortedFile, applying
//! dedup, tombstone, and history-retention rules.
//!
//! The merge runs twice over the same input streams: a planning pass counts
//! surviving records and bytes (the block reservation and meta header need
//! exact sizes up front), then a writing pass streams the output and fires
//! observer callbacks. Both passes run the identical decision logic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::block::{BlockStore, CatalogEntry, CatalogKind, StorageSpeed};
use crate::error::{Result, StrataError};
use crate::memlayer::Entry;

use super::{
    block_count_fixed_point, num_hash_fields, BlockChainWriter, HashIndexBuilder,
    SortedFileReader, SortedFileSummary, HASH_SLOT_SIZE, META_SIZE, TOMBSTONE_MARKER,
};

// =============================================================================
// Parameters & Observer
// =============================================================================

/// Retention parameters for one merge
#[derive(Debug, Clone, Copy)]
pub struct MergeParams {
    /// Sequence watermark below which superseded/expired versions may be
    /// physically dropped
    pub release_up_to: u64,
    /// Tail mode: the merge covers a single aging generation and may drop
    /// all history outright
    pub can_tail: bool,
    /// In tail mode, expired tombstones themselves may be dropped (nothing
    /// below this merge can resurrect the id)
    pub can_tail_tombstone: bool,
}

impl MergeParams {
    /// Standard N-generation merge: keep authoritative records, carry
    /// expired tombstones
    pub fn standard(release_up_to: u64) -> Self {
        Self {
            release_up_to,
            can_tail: false,
            can_tail_tombstone: false,
        }
    }

    /// Single-generation tail merge that also drops expired tombstones
    pub fn tail(release_up_to: u64) -> Self {
        Self {
            release_up_to,
            can_tail: true,
            can_tail_tombstone: true,
        }
    }
}

/// Per-id outcome reported to the merge observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The id's authoritative record was written to the output
    Survived,
    /// The id was dropped: its authoritative record fell below the release
    /// watermark (or was a droppable tombstone in tail mode)
    Expired,
    /// A historical record for the id was discarded in favor of a newer one
    Superseded,
}

/// Callback fired once per surviving/expired id and once per superseded
/// historical record. Consumed externally for cache invalidation and
/// replication bookkeeping.
pub type MergeObserver<'a> = &'a mut dyn FnMut(Uuid, MergeOutcome);

// =============================================================================
// Merge Core
// =============================================================================

/// What the merge decided to do with one input record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Authoritative record of a surviving id: goes to the output
    Write,
    /// Authoritative record of an expired id: dropped
    Expire,
    /// Historical duplicate: dropped
    Supersede,
}

/// One input stream's current record, ordered ascending by id and within an
/// id descending by sequence number
struct Head {
    entry: Entry,
    stream: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Head {}
impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Head {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.entry
            .id
            .cmp(&other.entry.id)
            .then(other.entry.seq.cmp(&self.entry.seq))
            .then(self.stream.cmp(&other.stream))
    }
}

/// Run the N-way merge, invoking `sink` once per input record with its
/// disposition. Records arrive ascending by id, per id newest-first.
fn run_merge(
    readers: &[SortedFileReader],
    params: MergeParams,
    sink: &mut dyn FnMut(&Entry, Disposition) -> Result<()>,
) -> Result<()> {
    let mut streams: Vec<_> = readers.iter().map(|r| r.scan()).collect();

    let mut heap: BinaryHeap<Reverse<Head>> = BinaryHeap::with_capacity(streams.len());
    for (stream, iter) in streams.iter_mut().enumerate() {
        if let Some(entry) = iter.next().transpose()? {
            heap.push(Reverse(Head { entry, stream }));
        }
    }

    let mut group: Option<(Uuid, u64)> = None;
    while let Some(Reverse(head)) = heap.pop() {
        if let Some(entry) = streams[head.stream].next().transpose()? {
            heap.push(Reverse(Head { entry, stream: head.stream }));
        }

        let record = head.entry;
        let disposition = match group {
            Some((id, last_seq)) if id == record.id => {
                // Sequence numbers are globally unique per id; a duplicate
                // means two generations disagree about history.
                if last_seq == record.seq {
                    return Err(StrataError::Corruption(format!(
                        "duplicate (id, seq) ({}, {}) across merge inputs",
                        record.id, record.seq
                    )));
                }
                Disposition::Supersede
            }
            _ => {
                // First record of a new id group is authoritative
                if record.deadline_count >= params.release_up_to {
                    Disposition::Write
                } else if record.is_tombstone()
                    && !(params.can_tail && params.can_tail_tombstone)
                {
                    // Expired tombstone still shadows older generations
                    Disposition::Write
                } else {
                    Disposition::Expire
                }
            }
        };
        group = Some((record.id, record.seq));

        sink(&record, disposition)?;
    }
    Ok(())
}

// =============================================================================
// Merge Entry Point
// =============================================================================

/// Merge `input_generations` into one new generation `output_generation`.
///
/// The caller republishes the Mapping afterwards; this function only writes
/// and catalogs the output file. Output sequence bounds cover the union of
/// the inputs' bounds even when records are dropped, so the Mapping's
/// coverage invariant holds after the swap.
#[allow(clippy::too_many_arguments)]
pub fn merge_sorted_files(
    store: &Arc<dyn BlockStore>,
    store_id: Uuid,
    kind: CatalogKind,
    output_generation: u64,
    input_generations: &[u64],
    speed: StorageSpeed,
    params: MergeParams,
    mut observer: Option<MergeObserver<'_>>,
) -> Result<SortedFileSummary> {
    let readers: Vec<SortedFileReader> = input_generations
        .iter()
        .map(|gen| SortedFileReader::open(Arc::clone(store), store_id, *gen))
        .collect::<Result<_>>()?;

    let lowest_seq = readers.iter().map(|r| r.lowest_seq()).min().unwrap_or(0);
    let highest_seq = readers.iter().map(|r| r.highest_seq()).max().unwrap_or(0);

    // ---------------------------------------------------------------------
    // Planning pass: exact output sizes
    // ---------------------------------------------------------------------
    let mut num_written: u64 = 0;
    let mut written_bytes: u64 = 0;
    run_merge(&readers, params, &mut |entry, disposition| {
        if disposition == Disposition::Write {
            num_written += 1;
            written_bytes += entry.record_size();
        }
        Ok(())
    })?;

    let hash_fields = num_hash_fields(num_written);
    let content_bytes = META_SIZE + written_bytes + hash_fields * HASH_SLOT_SIZE;
    let num_blocks = block_count_fixed_point(content_bytes);
    let total_bytes = content_bytes + num_blocks * 8;
    let hash_index_offset = META_SIZE + num_blocks * 8 + written_bytes;

    // ---------------------------------------------------------------------
    // Writing pass
    // ---------------------------------------------------------------------
    let blocks = store.reserve_blocks(speed, num_blocks)?;
    let mut writer = BlockChainWriter::new(store.as_ref(), &blocks);

    writer.write_u64(num_written)?;
    writer.write_u64(num_blocks)?;
    writer.write_u64(hash_index_offset)?;
    writer.write_u64(hash_fields)?;
    for block in &blocks {
        writer.write_u64(block.0)?;
    }

    let mut hash = HashIndexBuilder::new(hash_fields);
    run_merge(&readers, params, &mut |entry, disposition| {
        match disposition {
            Disposition::Write => {
                hash.insert(entry.id, writer.position());
                writer.write(entry.id.as_bytes())?;
                writer.write_u64(entry.seq)?;
                writer.write_u64(entry.deadline_count)?;
                match &entry.payload {
                    Some(payload) => {
                        writer.write_u64(payload.len() as u64)?;
                        writer.write(payload)?;
                    }
                    None => writer.write_u64(TOMBSTONE_MARKER)?,
                }
                if let Some(observer) = observer.as_deref_mut() {
                    observer(entry.id, MergeOutcome::Survived);
                }
            }
            Disposition::Expire => {
                if let Some(observer) = observer.as_deref_mut() {
                    observer(entry.id, MergeOutcome::Expired);
                }
            }
            Disposition::Supersede => {
                if let Some(observer) = observer.as_deref_mut() {
                    observer(entry.id, MergeOutcome::Superseded);
                }
            }
        }
        Ok(())
    })?;

    debug_assert_eq!(writer.position(), hash_index_offset);

    for slot in hash.finish() {
        match slot {
            Some(slot) => {
                writer.write(slot.id.as_bytes())?;
                writer.write_u64(slot.byte_offset)?;
            }
            None => {
                writer.write(Uuid::nil().as_bytes())?;
                writer.write_u64(0)?;
            }
        }
    }

    let written = writer.finish()?;
    debug_assert_eq!(written, total_bytes);
    store.sync()?;

    store.insert_catalog_entry(CatalogEntry {
        store: store_id,
        kind,
        generation: output_generation,
        start_block: blocks[0].0,
        start_offset: 0,
        length: total_bytes,
        num_keys: num_written,
        lowest_seq,
        highest_seq,
    })?;

    debug!(
        output_generation,
        inputs = input_generations.len(),
        num_written,
        num_blocks,
        can_tail = params.can_tail,
        "merged generations"
    );

    Ok(SortedFileSummary {
        generation: output_generation,
        lowest_seq,
        highest_seq,
        num_keys: num_written,
    })
}
