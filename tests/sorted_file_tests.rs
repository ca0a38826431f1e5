//! Tests for the SortedFile write path and reader
//!
//! These tests verify:
//! - Round-trip: write a memory layer, scan it back and look ids up
//!   through the hash index
//! - Id ordering and per-id newest-first record order
//! - Tombstone handling in the hash index
//! - Multi-block files and blockmap bootstrap
//! - Catalog registration ordering and checksum verification

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use uuid::Uuid;

use stratakv::block::{BlockStore, CatalogKind, FileBlockStore, StorageSpeed};
use stratakv::memlayer::{Entry, MemoryLayer};
use stratakv::sorted::{write_sorted_file, SortedFileReader};
use stratakv::StrataError;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> (TempDir, Arc<dyn BlockStore>) {
    let temp = TempDir::new().unwrap();
    let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(temp.path()).unwrap());
    (temp, store)
}

fn entry(id: Uuid, seq: u64, payload: &[u8]) -> Entry {
    Entry {
        id,
        seq,
        deadline_count: 0,
        payload: Some(Bytes::copy_from_slice(payload)),
    }
}

fn tombstone(id: Uuid, seq: u64) -> Entry {
    Entry {
        id,
        seq,
        deadline_count: 0,
        payload: None,
    }
}

/// Build a layer with `count` distinct ids, one version each
fn layer_with_entries(count: usize) -> (MemoryLayer, Vec<Uuid>) {
    let layer = MemoryLayer::new();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = Uuid::new_v4();
        layer.insert(entry(id, i as u64 + 1, format!("value{}", i).as_bytes()));
        ids.push(id);
    }
    (layer, ids)
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn round_trip_scan_and_hash() {
    let (_temp, store) = setup_store();
    let store_id = Uuid::new_v4();
    let (layer, ids) = layer_with_entries(50);

    let summary = write_sorted_file(
        &store,
        store_id,
        CatalogKind::DataFile,
        1,
        &layer,
        StorageSpeed::Fast,
        0,
    )
    .unwrap();
    assert_eq!(summary.num_keys, 50);
    assert_eq!(summary.lowest_seq, 1);
    assert_eq!(summary.highest_seq, 50);

    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 1).unwrap();

    // Scan: exactly 50 entries, ascending by id
    let scanned: Vec<Entry> = reader.scan().map(|e| e.unwrap()).collect();
    assert_eq!(scanned.len(), 50);
    for pair in scanned.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }

    // Hash: every written id found, with the right payload
    for id in &ids {
        let found = reader.find_in_hash(id).unwrap().unwrap();
        assert_eq!(found.id, *id);
        let expected = layer.find_max(id).unwrap();
        assert_eq!(found.payload, expected.payload);
        assert_eq!(found.seq, expected.seq);
    }

    // Absent ids miss
    for _ in 0..20 {
        assert!(reader.find_in_hash(&Uuid::new_v4()).unwrap().is_none());
    }
}

#[test]
fn multiple_versions_hash_returns_newest() {
    let (_temp, store) = setup_store();
    let store_id = Uuid::new_v4();
    let id = Uuid::new_v4();

    let layer = MemoryLayer::new();
    layer.insert(entry(id, 1, b"v1"));
    layer.insert(entry(id, 2, b"v2"));
    layer.insert(entry(id, 3, b"v3"));

    write_sorted_file(
        &store,
        store_id,
        CatalogKind::DataFile,
        7,
        &layer,
        StorageSpeed::Fast,
        0,
    )
    .unwrap();

    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 7).unwrap();

    // All versions are carried, newest first within the id
    let scanned: Vec<Entry> = reader.scan().map(|e| e.unwrap()).collect();
    assert_eq!(scanned.len(), 3);
    assert_eq!(scanned[0].seq, 3);
    assert_eq!(scanned[1].seq, 2);
    assert_eq!(scanned[2].seq, 1);

    // Hash points at the authoritative record
    let found = reader.find_in_hash(&id).unwrap().unwrap();
    assert_eq!(found.payload.unwrap(), Bytes::from_static(b"v3"));
}

#[test]
fn tombstones_are_found_as_tombstones() {
    let (_temp, store) = setup_store();
    let store_id = Uuid::new_v4();
    let id = Uuid::new_v4();

    let layer = MemoryLayer::new();
    layer.insert(tombstone(id, 5));

    write_sorted_file(
        &store,
        store_id,
        CatalogKind::DataFile,
        1,
        &layer,
        StorageSpeed::Fast,
        0,
    )
    .unwrap();

    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 1).unwrap();
    let found = reader.find_in_hash(&id).unwrap().unwrap();
    assert!(found.is_tombstone());
    assert_eq!(found.seq, 5);
}

#[test]
fn empty_layer_is_rejected() {
    let (_temp, store) = setup_store();
    let layer = MemoryLayer::new();
    let err = write_sorted_file(
        &store,
        Uuid::new_v4(),
        CatalogKind::DataFile,
        1,
        &layer,
        StorageSpeed::Fast,
        0,
    )
    .unwrap_err();
    assert!(matches!(err, StrataError::Corruption(_)));
}

// =============================================================================
// Multi-block Files
// =============================================================================

#[test]
fn large_file_spans_multiple_blocks() {
    let (_temp, store) = setup_store();
    let store_id = Uuid::new_v4();

    let layer = MemoryLayer::new();
    let mut ids = Vec::new();
    let big = vec![0xabu8; 2048];
    for i in 0..200 {
        let id = Uuid::new_v4();
        layer.insert(entry(id, i + 1, &big));
        ids.push(id);
    }

    write_sorted_file(
        &store,
        store_id,
        CatalogKind::DataFile,
        1,
        &layer,
        StorageSpeed::Fast,
        0,
    )
    .unwrap();

    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 1).unwrap();
    assert!(reader.meta().num_blocks > 1);
    assert_eq!(reader.scan().count(), 200);

    for id in &ids {
        let found = reader.find_in_hash(id).unwrap().unwrap();
        assert_eq!(found.payload.unwrap().len(), 2048);
    }
}

// =============================================================================
// Catalog & Durability
// =============================================================================

#[test]
fn generation_survives_store_reopen() {
    let temp = TempDir::new().unwrap();
    let store_id = Uuid::new_v4();
    let (layer, ids) = layer_with_entries(10);

    {
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(temp.path()).unwrap());
        write_sorted_file(
            &store,
            store_id,
            CatalogKind::DataFile,
            3,
            &layer,
            StorageSpeed::Fast,
            0,
        )
        .unwrap();
    }

    // Fresh process: catalog resolves the generation again
    let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(temp.path()).unwrap());
    let cataloged = store.list_catalog(store_id, CatalogKind::DataFile).unwrap();
    assert_eq!(cataloged.len(), 1);
    assert_eq!(cataloged[0].generation, 3);
    assert_eq!(cataloged[0].num_keys, 10);

    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 3).unwrap();
    for id in &ids {
        assert!(reader.find_in_hash(id).unwrap().is_some());
    }
}

#[test]
fn release_watermark_excludes_expired_from_num_keys() {
    let (_temp, store) = setup_store();
    let store_id = Uuid::new_v4();

    let layer = MemoryLayer::new();
    let live = Uuid::new_v4();
    let expired = Uuid::new_v4();
    layer.insert(Entry {
        id: live,
        seq: 1,
        deadline_count: 10,
        payload: Some(Bytes::from_static(b"live")),
    });
    layer.insert(Entry {
        id: expired,
        seq: 2,
        deadline_count: 1,
        payload: Some(Bytes::from_static(b"old")),
    });

    let summary = write_sorted_file(
        &store,
        store_id,
        CatalogKind::DataFile,
        1,
        &layer,
        StorageSpeed::Fast,
        5,
    )
    .unwrap();

    // Expired entry is still carried (and findable) but not counted durable
    assert_eq!(summary.num_keys, 1);
    let reader = SortedFileReader::open(Arc::clone(&store), store_id, 1).unwrap();
    assert!(reader.find_in_hash(&expired).unwrap().is_some());
    assert!(reader.find_in_hash(&live).unwrap().is_some());
}

#[test]
fn corrupted_block_fails_checksum() {
    use std::io::{Seek, SeekFrom, Write};

    let temp = TempDir::new().unwrap();
    let store_id = Uuid::new_v4();
    let (layer, _ids) = layer_with_entries(5);

    {
        let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(temp.path()).unwrap());
        write_sorted_file(
            &store,
            store_id,
            CatalogKind::DataFile,
            1,
            &layer,
            StorageSpeed::Fast,
            0,
        )
        .unwrap();
    }

    // Flip one byte in the first physical page of the fast-tier file
    let path = temp.path().join("blocks_fast.dat");
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(100)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(100)).unwrap();
    file.write_all(&[byte[0] ^ 0xff]).unwrap();
    file.sync_all().unwrap();

    let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::open(temp.path()).unwrap());
    let err = match SortedFileReader::open(Arc::clone(&store), store_id, 1) {
        Ok(_) => panic!("open accepted a corrupted block"),
        Err(err) => err,
    };
    assert!(matches!(err, StrataError::Corruption(_)));
}
