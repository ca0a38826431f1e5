//! SortedFile Write Path
//!
//! Persists a memory layer as a new immutable generation: one walk to size
//! the file, block reservation, then a single sequential stream in layout
//! order. The catalog insert is the last action, so a crash mid-write never
//! leaves a registered partial generation.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::block::{BlockStore, CatalogEntry, CatalogKind, StorageSpeed};
use crate::error::{Result, StrataError};
use crate::memlayer::MemoryLayer;

use super::{
    block_count_fixed_point, num_hash_fields, BlockChainWriter, HashIndexBuilder,
    SortedFileSummary, HASH_SLOT_SIZE, META_SIZE, TOMBSTONE_MARKER,
};

/// Write `layer` out as generation `generation` of `store_id`.
///
/// Entries land in id order, per id newest-first (the layer's walk order).
/// `num_keys` in the returned summary counts only durable ids: those whose
/// authoritative entry satisfies `deadline_count >= release_up_to`. Entries
/// below the watermark are still carried in the file (and hash-indexed) so a
/// later merge can apply tombstone-visibility rules.
pub fn write_sorted_file(
    store: &Arc<dyn BlockStore>,
    store_id: Uuid,
    kind: CatalogKind,
    generation: u64,
    layer: &MemoryLayer,
    speed: StorageSpeed,
    release_up_to: u64,
) -> Result<SortedFileSummary> {
    let entries = layer.walk();
    if entries.is_empty() {
        return Err(StrataError::Corruption(
            "refusing to write an empty generation".to_string(),
        ));
    }

    // ---------------------------------------------------------------------
    // Pass over the walk: distinct ids, durable count, byte sizes
    // ---------------------------------------------------------------------
    let mut distinct_ids: u64 = 0;
    let mut num_durable: u64 = 0;
    let mut entry_bytes: u64 = 0;
    let mut prev_id: Option<Uuid> = None;
    for entry in &entries {
        if entry.id.is_nil() {
            return Err(StrataError::Corruption(
                "nil uuid is reserved as the hash sentinel".to_string(),
            ));
        }
        entry_bytes += entry.record_size();
        if prev_id != Some(entry.id) {
            // First occurrence per id is authoritative (walk is newest-first)
            distinct_ids += 1;
            if entry.deadline_count >= release_up_to {
                num_durable += 1;
            }
            prev_id = Some(entry.id);
        }
    }

    let hash_fields = num_hash_fields(distinct_ids);
    let content_bytes = META_SIZE + entry_bytes + hash_fields * HASH_SLOT_SIZE;
    let num_blocks = block_count_fixed_point(content_bytes);
    let total_bytes = content_bytes + num_blocks * 8;

    let entries_start = META_SIZE + num_blocks * 8;
    let hash_index_offset = entries_start + entry_bytes;

    // ---------------------------------------------------------------------
    // Reserve the chain and stream in layout order
    // ---------------------------------------------------------------------
    let blocks = store.reserve_blocks(speed, num_blocks)?;
    let mut writer = BlockChainWriter::new(store.as_ref(), &blocks);

    writer.write_u64(entries.len() as u64)?;
    writer.write_u64(num_blocks)?;
    writer.write_u64(hash_index_offset)?;
    writer.write_u64(hash_fields)?;

    for block in &blocks {
        writer.write_u64(block.0)?;
    }

    let mut hash = HashIndexBuilder::new(hash_fields);
    let mut prev_id = None;
    for entry in &entries {
        if prev_id != Some(entry.id) {
            hash.insert(entry.id, writer.position());
            prev_id = Some(entry.id);
        }

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
    }

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

    // ---------------------------------------------------------------------
    // Register last: the generation exists once the catalog insert is durable
    // ---------------------------------------------------------------------
    let lowest_seq = layer.lowest_seq().unwrap_or(0);
    let highest_seq = layer.highest_seq().unwrap_or(0);
    store.insert_catalog_entry(CatalogEntry {
        store: store_id,
        kind,
        generation,
        start_block: blocks[0].0,
        start_offset: 0,
        length: total_bytes,
        num_keys: num_durable,
        lowest_seq,
        highest_seq,
    })?;

    debug!(
        generation,
        num_entries = entries.len(),
        num_durable,
        num_blocks,
        "flushed memory layer to sorted file"
    );

    Ok(SortedFileSummary {
        generation,
        lowest_seq,
        highest_seq,
        num_keys: num_durable,
    })
}
