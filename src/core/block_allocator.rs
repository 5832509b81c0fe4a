//! Fixed-size block pool.
//!
//! A `BlockAllocator` manages one pool of physical blocks (GPU or host),
//! similar to how an operating system manages physical memory pages.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) allocation; frees are ordered by last use
//! - **Reference counting**: a block is shared by every table that points at it
//! - **Conservation**: `num_free_blocks() + num_used_blocks() == num_blocks()`
//!
//! The allocator never evicts on its own. It reports capacity and performs the
//! moves the scheduler asks for.
//!
//! ## Example
//!
//! ```
//! use paged_serve::core::block::BlockDevice;
//! use paged_serve::core::block_allocator::BlockAllocator;
//!
//! let mut allocator = BlockAllocator::new(BlockDevice::Gpu, 1024, 16);
//!
//! let block_id = allocator.allocate().unwrap();
//! assert_eq!(allocator.num_free_blocks(), 1023);
//!
//! allocator.free(block_id).unwrap();
//! assert_eq!(allocator.num_free_blocks(), 1024);
//! ```

use std::collections::{HashMap, VecDeque};

use crate::core::block::{Block, BlockDevice, BlockId};
use crate::error::{Error, Result};

/// Manages allocation and deallocation of the blocks of one pool.
#[derive(Debug)]
pub struct BlockAllocator {
    device: BlockDevice,
    /// Allocated blocks indexed by block_id.
    blocks: HashMap<BlockId, Block>,
    /// Free block IDs, least recently used first.
    free_list: VecDeque<BlockId>,
    /// Last-use tick of every block, kept across frees for LRU ordering.
    last_used: Vec<u64>,
    /// Logical clock.
    clock: u64,
    block_size: usize,
    num_blocks: usize,
}

impl BlockAllocator {
    /// Create an allocator over `num_blocks` blocks of `block_size` tokens.
    pub fn new(device: BlockDevice, num_blocks: usize, block_size: usize) -> Self {
        Self {
            device,
            blocks: HashMap::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            last_used: vec![0; num_blocks],
            clock: 0,
            block_size,
            num_blocks,
        }
    }

    pub fn device(&self) -> BlockDevice {
        self.device
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    /// Allocate a single block with reference count 1.
    ///
    /// The least recently used free block is handed out first, so the
    /// contents of recently released blocks survive longest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the pool is exhausted.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = self.free_list.pop_front().ok_or(Error::AllocationFailure {
            device: self.device,
            requested: 1,
            available: 0,
        })?;

        let tick = self.tick();
        let mut block = Block::new(block_id, self.device, self.block_size);
        block.touch(tick);
        self.last_used[block_id] = tick;
        self.blocks.insert(block_id, block);

        Ok(block_id)
    }

    /// Allocate `num_blocks` blocks, or none at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] without side effects if not
    /// enough blocks are free.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::AllocationFailure {
                device: self.device,
                requested: num_blocks,
                available: self.free_list.len(),
            });
        }

        (0..num_blocks).map(|_| self.allocate()).collect()
    }

    /// Drop one reference to a block, returning it to the free list at zero.
    ///
    /// # Returns
    ///
    /// `true` if the block was freed, `false` if it still has references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockNotAllocated`] on a double free.
    pub fn free(&mut self, block_id: BlockId) -> Result<bool> {
        let block = self.blocks.get_mut(&block_id).ok_or(Error::BlockNotAllocated {
            device: self.device,
            block_id,
        })?;

        if block.decrement_ref() > 0 {
            return Ok(false);
        }

        let block = self.blocks.remove(&block_id).ok_or(Error::BlockNotAllocated {
            device: self.device,
            block_id,
        })?;
        self.release(block.block_id());
        Ok(true)
    }

    /// Free multiple blocks, returning how many reached zero references.
    pub fn free_many(&mut self, block_ids: &[BlockId]) -> Result<usize> {
        let mut freed = 0;
        for &block_id in block_ids {
            if self.free(block_id)? {
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Add a reference to an allocated block (copy-on-write sharing).
    ///
    /// # Returns
    ///
    /// The new reference count.
    pub fn fork(&mut self, block_id: BlockId) -> Result<usize> {
        let tick = self.tick();
        let block = self.get_block_mut(block_id)?;
        block.increment_ref();
        block.touch(tick);
        let ref_count = block.ref_count();
        self.last_used[block_id] = tick;
        Ok(ref_count)
    }

    /// Record an access for LRU ordering.
    pub fn touch(&mut self, block_id: BlockId) -> Result<()> {
        let tick = self.tick();
        self.get_block_mut(block_id)?.touch(tick);
        self.last_used[block_id] = tick;
        Ok(())
    }

    pub fn ref_count(&self, block_id: BlockId) -> Option<usize> {
        self.blocks.get(&block_id).map(Block::ref_count)
    }

    pub fn get_block(&self, block_id: BlockId) -> Option<&Block> {
        self.blocks.get(&block_id)
    }

    pub(crate) fn get_block_mut(&mut self, block_id: BlockId) -> Result<&mut Block> {
        self.blocks.get_mut(&block_id).ok_or(Error::BlockNotAllocated {
            device: self.device,
            block_id,
        })
    }

    /// Sum of reference counts over all allocated blocks.
    pub fn total_ref_count(&self) -> usize {
        self.blocks.values().map(Block::ref_count).sum()
    }

    /// Free block IDs in reuse order.
    pub fn free_block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.free_list.iter().copied()
    }

    /// Reset the pool: every block is freed.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.free_list.clear();
        self.free_list.extend(0..self.num_blocks);
        self.last_used.iter_mut().for_each(|t| *t = 0);
        self.clock = 0;
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Insert into the free list keeping it sorted by last use.
    fn release(&mut self, block_id: BlockId) {
        let last_used = self.last_used[block_id];
        let pos = self
            .free_list
            .partition_point(|&id| self.last_used[id] <= last_used);
        self.free_list.insert(pos, block_id);
    }
}
