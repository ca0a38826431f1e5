//! File-Backed Block Store
//!
//! Default [`BlockStore`] implementation: one flat file per speed tier plus a
//! persistent catalog. Blocks are allocated from a high-water mark with an
//! in-memory free list for recycled ids; every physical page carries a crc32
//! trailer verified on read.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, StrataError};

use super::{
    BlockId, BlockStore, Catalog, CatalogEntry, CatalogKind, StorageSpeed, LOGICAL_BLOCK_SIZE,
    LOGICAL_PAGE_SIZE, PAGES_PER_BLOCK, PAGE_SIZE, PHYSICAL_BLOCK_SIZE, TRAILER_SIZE,
};

const FAST_FILENAME: &str = "blocks_fast.dat";
const SLOW_FILENAME: &str = "blocks_slow.dat";
const CATALOG_FILENAME: &str = "catalog.dat";

/// One speed tier's backing file and allocator state
struct Tier {
    file: File,
    /// High-water mark: blocks at index >= next are free
    next_index: AtomicU64,
    /// Recycled block indexes (process-lifetime only; rebuilt as the
    /// high-water mark on reopen)
    free: Mutex<Vec<u64>>,
}

impl Tier {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let next_index = len / PHYSICAL_BLOCK_SIZE as u64;
        Ok(Self {
            file,
            next_index: AtomicU64::new(next_index),
            free: Mutex::new(Vec::new()),
        })
    }

    fn reserve(&self, count: u64) -> Vec<u64> {
        let mut out = Vec::with_capacity(count as usize);
        let mut free = self.free.lock();
        while (out.len() as u64) < count {
            match free.pop() {
                Some(idx) => out.push(idx),
                None => out.push(self.next_index.fetch_add(1, Ordering::SeqCst)),
            }
        }
        out
    }
}

/// File-backed block store with per-page checksums
pub struct FileBlockStore {
    fast: Tier,
    slow: Tier,
    catalog: Catalog,
}

impl FileBlockStore {
    /// Open or create the block store under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            fast: Tier::open(&dir.join(FAST_FILENAME))?,
            slow: Tier::open(&dir.join(SLOW_FILENAME))?,
            catalog: Catalog::open(&dir.join(CATALOG_FILENAME))?,
        })
    }

    fn tier(&self, speed: StorageSpeed) -> &Tier {
        match speed {
            StorageSpeed::Fast => &self.fast,
            StorageSpeed::Slow => &self.slow,
        }
    }
}

impl BlockStore for FileBlockStore {
    fn reserve_blocks(&self, speed: StorageSpeed, count: u64) -> Result<Vec<BlockId>> {
        let indexes = self.tier(speed).reserve(count);
        Ok(indexes
            .into_iter()
            .map(|idx| BlockId::new(speed, idx))
            .collect())
    }

    fn free_blocks(&self, blocks: &[BlockId]) -> Result<()> {
        for block in blocks {
            self.tier(block.speed()).free.lock().push(block.index());
        }
        Ok(())
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() > LOGICAL_BLOCK_SIZE {
            return Err(StrataError::ResourceExhaustion(format!(
                "block write of {} bytes exceeds logical block size",
                data.len()
            )));
        }

        // Assemble physical block: per-page payload + crc32 trailer word
        let mut physical = vec![0u8; PHYSICAL_BLOCK_SIZE];
        for page in 0..PAGES_PER_BLOCK {
            let logical_start = page * LOGICAL_PAGE_SIZE;
            let phys_start = page * PAGE_SIZE;

            let payload = &mut physical[phys_start..phys_start + LOGICAL_PAGE_SIZE];
            if logical_start < data.len() {
                let end = (logical_start + LOGICAL_PAGE_SIZE).min(data.len());
                payload[..end - logical_start].copy_from_slice(&data[logical_start..end]);
            }

            let crc = crc32fast::hash(&physical[phys_start..phys_start + LOGICAL_PAGE_SIZE]);
            let mut trailer = [0u8; TRAILER_SIZE];
            trailer[..4].copy_from_slice(&crc.to_le_bytes());
            physical[phys_start + LOGICAL_PAGE_SIZE..phys_start + PAGE_SIZE]
                .copy_from_slice(&trailer);
        }

        let offset = block.index() * PHYSICAL_BLOCK_SIZE as u64;
        self.tier(block.speed()).file.write_all_at(&physical, offset)?;
        Ok(())
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != LOGICAL_BLOCK_SIZE {
            return Err(StrataError::Corruption(format!(
                "block read buffer of {} bytes, expected {}",
                buf.len(),
                LOGICAL_BLOCK_SIZE
            )));
        }

        let mut physical = vec![0u8; PHYSICAL_BLOCK_SIZE];
        let offset = block.index() * PHYSICAL_BLOCK_SIZE as u64;
        self.tier(block.speed()).file.read_exact_at(&mut physical, offset)?;

        for page in 0..PAGES_PER_BLOCK {
            let phys_start = page * PAGE_SIZE;
            let payload = &physical[phys_start..phys_start + LOGICAL_PAGE_SIZE];

            let stored = u32::from_le_bytes(
                physical[phys_start + LOGICAL_PAGE_SIZE..phys_start + LOGICAL_PAGE_SIZE + 4]
                    .try_into()
                    .unwrap(),
            );
            let computed = crc32fast::hash(payload);
            if stored != computed {
                return Err(StrataError::Corruption(format!(
                    "checksum mismatch in block {} page {}: stored {:08x}, computed {:08x}",
                    block.0, page, stored, computed
                )));
            }

            buf[page * LOGICAL_PAGE_SIZE..(page + 1) * LOGICAL_PAGE_SIZE]
                .copy_from_slice(payload);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.fast.file.sync_all()?;
        self.slow.file.sync_all()?;
        Ok(())
    }

    fn insert_catalog_entry(&self, entry: CatalogEntry) -> Result<()> {
        self.catalog.insert(entry)
    }

    fn remove_catalog_entry(&self, store: Uuid, generation: u64) -> Result<()> {
        self.catalog.remove(store, generation)
    }

    fn find_catalog_entry(&self, store: Uuid, generation: u64) -> Result<CatalogEntry> {
        self.catalog.find(store, generation)
    }

    fn list_catalog(&self, store: Uuid, kind: CatalogKind) -> Result<Vec<CatalogEntry>> {
        self.catalog.list(store, kind)
    }
}
