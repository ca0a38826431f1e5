//! Block-Chain Byte Streams
//!
//! A SortedFile is a contiguous byte stream laid over a chain of logical
//! blocks. The writer fills reserved blocks sequentially; the reader resolves
//! absolute byte offsets through the blockmap, bootstrapping the blockmap
//! itself out of the first block (the blockmap prefix in block 0 always
//! describes far more blocks than it spans, so parsing never outruns the
//! blocks already known).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{BlockId, BlockStore, LOGICAL_BLOCK_SIZE};
use crate::error::{Result, StrataError};

// =============================================================================
// Writer
// =============================================================================

/// Sequential writer over a pre-reserved block chain
pub struct BlockChainWriter<'a> {
    store: &'a dyn BlockStore,
    blocks: &'a [BlockId],
    /// Buffer for the block currently being filled
    buf: Vec<u8>,
    /// Index of the block `buf` belongs to
    block_index: usize,
    /// Total bytes written so far
    written: u64,
}

impl<'a> BlockChainWriter<'a> {
    pub fn new(store: &'a dyn BlockStore, blocks: &'a [BlockId]) -> Self {
        Self {
            store,
            blocks,
            buf: Vec::with_capacity(LOGICAL_BLOCK_SIZE),
            block_index: 0,
            written: 0,
        }
    }

    /// Append bytes, flushing full blocks as they fill
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = LOGICAL_BLOCK_SIZE - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.written += take as u64;

            if self.buf.len() == LOGICAL_BLOCK_SIZE {
                self.flush_current()?;
            }
        }
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    /// Total bytes written so far
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Flush the final partial block (zero-padded by the block store)
    pub fn finish(mut self) -> Result<u64> {
        if !self.buf.is_empty() {
            self.flush_current()?;
        }
        Ok(self.written)
    }

    fn flush_current(&mut self) -> Result<()> {
        let block = *self.blocks.get(self.block_index).ok_or_else(|| {
            StrataError::ResourceExhaustion(format!(
                "write ran past reserved chain of {} blocks",
                self.blocks.len()
            ))
        })?;
        self.store.write_block(block, &self.buf)?;
        self.buf.clear();
        self.block_index += 1;
        Ok(())
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Random-access reader over a block chain, with a one-block cache for
/// sequential scans
pub struct BlockChainReader {
    store: Arc<dyn BlockStore>,
    blocks: Vec<BlockId>,
    length: u64,
    cache: Mutex<Option<(usize, Vec<u8>)>>,
}

impl BlockChainReader {
    /// Bootstrap a reader from the chain's first block: callers read the
    /// meta header out of block 0 themselves, then hand the parsed blockmap
    /// here.
    pub fn new(store: Arc<dyn BlockStore>, blocks: Vec<BlockId>, length: u64) -> Self {
        Self {
            store,
            blocks,
            length,
            cache: Mutex::new(None),
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Read `buf.len()` bytes starting at absolute offset `offset`,
    /// crossing block boundaries as needed
    pub fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.length {
            return Err(StrataError::Corruption(format!(
                "read of {} bytes at offset {} past file length {}",
                buf.len(),
                offset,
                self.length
            )));
        }

        let block_size = LOGICAL_BLOCK_SIZE as u64;
        let mut filled = 0usize;
        while filled < buf.len() {
            let index = (offset / block_size) as usize;
            let within = (offset % block_size) as usize;
            let take = (LOGICAL_BLOCK_SIZE - within).min(buf.len() - filled);

            let mut cache = self.cache.lock();
            let hit = matches!(&*cache, Some((cached, _)) if *cached == index);
            if !hit {
                let mut data = vec![0u8; LOGICAL_BLOCK_SIZE];
                let block = *self.blocks.get(index).ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "offset {} resolves past blockmap of {} blocks",
                        offset,
                        self.blocks.len()
                    ))
                })?;
                self.store.read_block(block, &mut data)?;
                *cache = Some((index, data));
            }
            let (_, data) = cache.as_ref().unwrap();
            buf[filled..filled + take].copy_from_slice(&data[within..within + take]);

            filled += take;
            offset += take as u64;
        }
        Ok(())
    }

    pub fn read_u64_at(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
