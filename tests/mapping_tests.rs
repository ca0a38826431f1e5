//! Tests for Mapping transforms and layer take-flag exclusivity

use std::sync::Arc;

use stratakv::block::StorageSpeed;
use stratakv::mapping::{DiskLayer, LayerHandle, Mapping};
use stratakv::MemoryLayer;

// =============================================================================
// Helper Functions
// =============================================================================

fn disk(generation: u64, lowest_seq: u64, highest_seq: u64) -> Arc<LayerHandle> {
    LayerHandle::new_disk(DiskLayer {
        generation,
        num_keys: 1,
        lowest_seq,
        highest_seq,
        speed: StorageSpeed::Fast,
    })
}

fn mem() -> Arc<LayerHandle> {
    LayerHandle::new_memory(Arc::new(MemoryLayer::new()), StorageSpeed::Fast)
}

fn generations(mapping: &Mapping) -> Vec<u64> {
    mapping
        .layers()
        .iter()
        .filter_map(|l| l.as_disk())
        .map(|d| d.generation)
        .collect()
}

// =============================================================================
// Transforms
// =============================================================================

#[test]
fn append_keeps_order_and_shares_layers() {
    let base = Mapping::from_layers(vec![disk(1, 1, 10), disk(2, 11, 20)]);
    let appended = base.with_appended(disk(3, 21, 30));

    assert_eq!(generations(&base), vec![1, 2]);
    assert_eq!(generations(&appended), vec![1, 2, 3]);
    // The transform shares the untouched layers rather than copying them
    assert!(Arc::ptr_eq(&base.layers()[0], &appended.layers()[0]));
    assert!(Arc::ptr_eq(&base.layers()[1], &appended.layers()[1]));
}

#[test]
fn replace_swaps_in_place() {
    let target = disk(2, 11, 20);
    let base = Mapping::from_layers(vec![disk(1, 1, 10), Arc::clone(&target), disk(3, 21, 30)]);

    let replaced = base.with_replaced(&target, disk(4, 11, 20));
    assert_eq!(generations(&replaced), vec![1, 4, 3]);
    assert_eq!(generations(&base), vec![1, 2, 3]);
}

#[test]
fn remove_drops_only_the_target() {
    let target = disk(2, 11, 20);
    let base = Mapping::from_layers(vec![disk(1, 1, 10), Arc::clone(&target), disk(3, 21, 30)]);

    let removed = base.with_removed(&target);
    assert_eq!(generations(&removed), vec![1, 3]);
}

#[test]
fn group_replace_lands_at_oldest_member_position() {
    let g1 = disk(1, 1, 10);
    let g2 = disk(2, 11, 20);
    let g4 = disk(4, 31, 40);
    let base = Mapping::from_layers(vec![
        Arc::clone(&g1),
        Arc::clone(&g2),
        disk(3, 21, 30),
        Arc::clone(&g4),
    ]);

    // Merge of non-adjacent members 1, 2 and 4 into generation 5
    let merged = base.with_group_replaced(
        &[Arc::clone(&g1), Arc::clone(&g2), Arc::clone(&g4)],
        disk(5, 1, 40),
    );
    assert_eq!(generations(&merged), vec![5, 3]);
}

#[test]
fn memory_layers_append_after_disk_layers() {
    let base = Mapping::from_layers(vec![disk(1, 1, 10)]);
    let with_mem = base.with_appended(mem());

    assert_eq!(with_mem.disk_layer_count(), 1);
    assert_eq!(with_mem.memory_layer_count(), 1);
    assert!(with_mem.layers()[1].as_memory().is_some());
}

#[test]
fn lowest_seq_covers_all_layers() {
    let empty = Mapping::empty();
    assert_eq!(empty.lowest_seq(), None);

    let base = Mapping::from_layers(vec![disk(2, 5, 20), disk(1, 1, 4)]);
    assert_eq!(base.lowest_seq(), Some(1));
}

// =============================================================================
// Take Flag
// =============================================================================

#[test]
fn take_is_exclusive_until_released() {
    let layer = disk(1, 1, 10);

    assert!(layer.try_take());
    assert!(layer.is_taken());
    // Second claimant loses
    assert!(!layer.try_take());

    layer.release_taken();
    assert!(!layer.is_taken());
    assert!(layer.try_take());
}

#[test]
fn mark_for_delete_is_sticky() {
    let layer = disk(1, 1, 10);
    assert!(!layer.is_marked_for_delete());
    layer.mark_for_delete();
    assert!(layer.is_marked_for_delete());
    layer.mark_for_delete();
    assert!(layer.is_marked_for_delete());
}
