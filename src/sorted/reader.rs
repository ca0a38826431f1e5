//! SortedFile Reader
//!
//! Opens a cataloged generation, bootstraps its blockmap from the first
//! block, and serves hash-indexed point lookups plus sequential scans.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::block::{BlockId, BlockStore, CatalogEntry, LOGICAL_BLOCK_SIZE};
use crate::error::{Result, StrataError};
use crate::memlayer::Entry;

use super::{
    slot_hash, BlockChainReader, SortedFileMeta, ENTRY_FIXED_SIZE, HASH_SLOT_SIZE, META_SIZE,
    TOMBSTONE_MARKER,
};

/// Reader over one immutable on-disk generation
pub struct SortedFileReader {
    chain: BlockChainReader,
    meta: SortedFileMeta,
    catalog: CatalogEntry,
}

impl SortedFileReader {
    /// Open generation `generation` of `store_id` via the catalog
    pub fn open(store: Arc<dyn BlockStore>, store_id: Uuid, generation: u64) -> Result<Self> {
        let catalog = store.find_catalog_entry(store_id, generation)?;
        Self::open_cataloged(store, catalog)
    }

    /// Open a generation from an already-resolved catalog entry
    pub fn open_cataloged(store: Arc<dyn BlockStore>, catalog: CatalogEntry) -> Result<Self> {
        // Bootstrap: meta + blockmap prefix live in the first block. Block 0
        // describes ~8k blocks, far more than the blockmap itself spans, so
        // progressive parsing never needs a block id it has not yet read.
        let first = BlockId(catalog.start_block);
        let mut block0 = vec![0u8; LOGICAL_BLOCK_SIZE];
        store.read_block(first, &mut block0)?;

        let word = |data: &[u8], off: usize| -> u64 {
            u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
        };
        let meta = SortedFileMeta {
            num_entries: word(&block0, 0),
            num_blocks: word(&block0, 8),
            hash_index_offset: word(&block0, 16),
            hash_field_size: word(&block0, 24),
        };

        if meta.num_blocks == 0
            || meta.hash_index_offset + meta.hash_field_size * HASH_SLOT_SIZE != catalog.length
            || META_SIZE + meta.num_blocks * 8 > meta.hash_index_offset
        {
            return Err(StrataError::Corruption(format!(
                "generation {} meta does not match catalog length {}",
                catalog.generation, catalog.length
            )));
        }

        let mut blocks: Vec<BlockId> = Vec::with_capacity(meta.num_blocks as usize);
        let mut fetched: Option<(usize, Vec<u8>)> = None;
        for k in 0..meta.num_blocks {
            let offset = META_SIZE + 8 * k;
            let index = (offset / LOGICAL_BLOCK_SIZE as u64) as usize;
            let within = (offset % LOGICAL_BLOCK_SIZE as u64) as usize;

            let raw = if index == 0 {
                word(&block0, within)
            } else {
                if index >= blocks.len() {
                    return Err(StrataError::Corruption(format!(
                        "generation {} blockmap outruns its own prefix",
                        catalog.generation
                    )));
                }
                let cached = matches!(&fetched, Some((i, _)) if *i == index);
                if !cached {
                    let mut data = vec![0u8; LOGICAL_BLOCK_SIZE];
                    store.read_block(blocks[index], &mut data)?;
                    fetched = Some((index, data));
                }
                word(&fetched.as_ref().unwrap().1, within)
            };
            blocks.push(BlockId(raw));
        }

        if blocks[0] != first {
            return Err(StrataError::Corruption(format!(
                "generation {} blockmap does not start at its catalog block",
                catalog.generation
            )));
        }

        let chain = BlockChainReader::new(store, blocks, catalog.length);
        Ok(Self { chain, meta, catalog })
    }

    pub fn meta(&self) -> &SortedFileMeta {
        &self.meta
    }

    pub fn generation(&self) -> u64 {
        self.catalog.generation
    }

    pub fn num_keys(&self) -> u64 {
        self.catalog.num_keys
    }

    pub fn lowest_seq(&self) -> u64 {
        self.catalog.lowest_seq
    }

    pub fn highest_seq(&self) -> u64 {
        self.catalog.highest_seq
    }

    /// All logical blocks of this file (for reclamation)
    pub fn block_ids(&self) -> &[BlockId] {
        self.chain.blocks()
    }

    /// Approximate resident bytes of this reader: blockmap plus the chain's
    /// one-block cache
    pub fn resident_bytes(&self) -> usize {
        self.chain.blocks().len() * 8 + LOGICAL_BLOCK_SIZE
    }

    /// First byte offset of the entries region
    fn entries_start(&self) -> u64 {
        META_SIZE + self.meta.num_blocks * 8
    }

    /// Hash-indexed point lookup: the authoritative entry for `id`, if the
    /// id is present in this generation. Tombstones are found (payload None).
    pub fn find_in_hash(&self, id: &Uuid) -> Result<Option<Entry>> {
        let fields = self.meta.hash_field_size;
        if fields == 0 || id.is_nil() {
            return Ok(None);
        }

        let start = slot_hash(id) % fields;
        for probe in 0..fields {
            let slot = (start + probe) % fields;
            let mut raw = [0u8; HASH_SLOT_SIZE as usize];
            self.chain
                .read_at(self.meta.hash_index_offset + slot * HASH_SLOT_SIZE, &mut raw)?;

            let slot_id = Uuid::from_bytes(raw[0..16].try_into().unwrap());
            if slot_id.is_nil() {
                return Ok(None);
            }
            if slot_id == *id {
                let offset = u64::from_le_bytes(raw[16..24].try_into().unwrap());
                let entry = self.read_entry_at(offset)?;
                if entry.id != *id {
                    return Err(StrataError::Corruption(format!(
                        "hash slot for {} points at entry for {}",
                        id, entry.id
                    )));
                }
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Decode one entry record at absolute offset `offset`
    fn read_entry_at(&self, offset: u64) -> Result<Entry> {
        let mut fixed = [0u8; ENTRY_FIXED_SIZE as usize];
        self.chain.read_at(offset, &mut fixed)?;

        let id = Uuid::from_bytes(fixed[0..16].try_into().unwrap());
        let seq = u64::from_le_bytes(fixed[16..24].try_into().unwrap());
        let deadline_count = u64::from_le_bytes(fixed[24..32].try_into().unwrap());
        let payload_len = u64::from_le_bytes(fixed[32..40].try_into().unwrap());

        let payload = if payload_len == TOMBSTONE_MARKER {
            None
        } else {
            if offset + ENTRY_FIXED_SIZE + payload_len > self.meta.hash_index_offset {
                return Err(StrataError::Corruption(format!(
                    "entry at offset {} runs past the entries region",
                    offset
                )));
            }
            let mut data = vec![0u8; payload_len as usize];
            self.chain.read_at(offset + ENTRY_FIXED_SIZE, &mut data)?;
            Some(Bytes::from(data))
        };

        Ok(Entry { id, seq, deadline_count, payload })
    }

    /// Sequential scan over all entries, ascending by id and per id
    /// newest-first (file order)
    pub fn scan(&self) -> ScanIter<'_> {
        ScanIter {
            reader: self,
            offset: self.entries_start(),
            remaining: self.meta.num_entries,
        }
    }
}

/// Iterator over a SortedFile's entries in file order
pub struct ScanIter<'a> {
    reader: &'a SortedFileReader,
    offset: u64,
    remaining: u64,
}

impl<'a> Iterator for ScanIter<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset >= self.reader.meta.hash_index_offset {
            self.remaining = 0;
            return Some(Err(StrataError::Corruption(
                "entry count runs past the entries region".to_string(),
            )));
        }

        match self.reader.read_entry_at(self.offset) {
            Ok(entry) => {
                self.offset += entry.record_size();
                self.remaining -= 1;
                Some(Ok(entry))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
