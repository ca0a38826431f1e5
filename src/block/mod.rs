//! Block Store Module
//!
//! Fixed-size logical block storage consumed by the SortedFile writer,
//! reader, and merger. The core depends only on the [`BlockStore`] contract;
//! [`FileBlockStore`] is the default file-backed implementation.
//!
//! ## Block Geometry
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Physical block = PAGES_PER_BLOCK pages                   │
//! │ ┌──────────────────────────────┬───────────────────────┐ │
//! │ │ Page payload (4088 bytes)    │ Checksum trailer (8)  │ │
//! │ └──────────────────────────────┴───────────────────────┘ │
//! │ ... repeated PAGES_PER_BLOCK times ...                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//! A logical block is the concatenation of the page payloads: one physical
//! page carries `PAGE_SIZE - TRAILER_SIZE` usable bytes, and a block groups
//! `PAGES_PER_BLOCK` pages.

mod catalog;
mod file_store;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use catalog::Catalog;
pub use file_store::FileBlockStore;

// =============================================================================
// Block Geometry Constants
// =============================================================================

/// Physical page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Checksum trailer per physical page: crc32, zero-padded to one u64 word
pub const TRAILER_SIZE: usize = 8;

/// Usable bytes per physical page
pub const LOGICAL_PAGE_SIZE: usize = PAGE_SIZE - TRAILER_SIZE;

/// Pages grouped into one block
pub const PAGES_PER_BLOCK: usize = 16;

/// Usable bytes per logical block
pub const LOGICAL_BLOCK_SIZE: usize = LOGICAL_PAGE_SIZE * PAGES_PER_BLOCK;

/// On-disk bytes per block (payloads + trailers)
pub const PHYSICAL_BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;

// =============================================================================
// Storage Speed Tiers
// =============================================================================

/// Storage speed tier a caller requests blocks from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageSpeed {
    /// Fast tier (e.g. SSD-backed); fresh flushes land here
    Fast,
    /// Slow tier (e.g. HDD-backed); aged generations migrate here
    Slow,
}

// =============================================================================
// Block Ids
// =============================================================================

/// Identifier of one logical block.
///
/// Encoded as a single u64 (the on-disk blockmap representation): the top
/// byte selects the speed tier, the low 56 bits index into that tier's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    const SPEED_SHIFT: u64 = 56;
    const INDEX_MASK: u64 = (1 << Self::SPEED_SHIFT) - 1;

    pub fn new(speed: StorageSpeed, index: u64) -> Self {
        debug_assert!(index <= Self::INDEX_MASK);
        let tag = match speed {
            StorageSpeed::Fast => 0u64,
            StorageSpeed::Slow => 1u64,
        };
        BlockId((tag << Self::SPEED_SHIFT) | index)
    }

    pub fn speed(self) -> StorageSpeed {
        if self.0 >> Self::SPEED_SHIFT == 0 {
            StorageSpeed::Fast
        } else {
            StorageSpeed::Slow
        }
    }

    pub fn index(self) -> u64 {
        self.0 & Self::INDEX_MASK
    }
}

// =============================================================================
// File Catalog Types
// =============================================================================

/// Which store a cataloged generation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogKind {
    /// Primary-store generation
    DataFile,
    /// Durable-object-store generation
    DurableFile,
}

/// One registered on-disk generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Owning store identifier
    pub store: Uuid,
    /// Primary vs durable-object generation
    pub kind: CatalogKind,
    /// Generation id (monotonically increasing per store)
    pub generation: u64,
    /// First logical block of the file (raw BlockId encoding)
    pub start_block: u64,
    /// Byte offset within the first block (always 0 today)
    pub start_offset: u64,
    /// Total byte length of the file content
    pub length: u64,
    /// Number of durable keys in the generation
    pub num_keys: u64,
    /// Lowest sequence number covered
    pub lowest_seq: u64,
    /// Highest sequence number covered
    pub highest_seq: u64,
}

// =============================================================================
// BlockStore Contract
// =============================================================================

/// Contract the storage core consumes.
///
/// Implementations must make `insert_catalog_entry` durable before returning:
/// the Mapping swap that makes a generation visible happens only after its
/// catalog insert, so a crash can never expose an unregistered generation.
pub trait BlockStore: Send + Sync {
    /// Reserve `count` free logical blocks on the given tier.
    fn reserve_blocks(&self, speed: StorageSpeed, count: u64) -> Result<Vec<BlockId>>;

    /// Return blocks to the free pool.
    fn free_blocks(&self, blocks: &[BlockId]) -> Result<()>;

    /// Write one logical block. `data` must not exceed `LOGICAL_BLOCK_SIZE`;
    /// short writes are zero-padded.
    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Read one logical block into `buf` (exactly `LOGICAL_BLOCK_SIZE` bytes),
    /// verifying per-page checksums.
    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Flush all written blocks to stable storage.
    fn sync(&self) -> Result<()>;

    /// Register a generation. Durable before return.
    fn insert_catalog_entry(&self, entry: CatalogEntry) -> Result<()>;

    /// Unregister a generation. Durable before return.
    fn remove_catalog_entry(&self, store: Uuid, generation: u64) -> Result<()>;

    /// Look up one generation.
    fn find_catalog_entry(&self, store: Uuid, generation: u64) -> Result<CatalogEntry>;

    /// List all generations of one kind for a store, ascending by generation.
    fn list_catalog(&self, store: Uuid, kind: CatalogKind) -> Result<Vec<CatalogEntry>>;
}
