//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A [`BlockTable`] plays the role
//! of a page table: it maps a sequence's logical block index to a physical
//! block in one of the pools.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Physical block number within a pool.
pub type BlockId = usize;

/// Which pool a physical block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockDevice {
    /// Accelerator memory; the only pool the compute step reads.
    Gpu,
    /// Host memory used as swap space for preempted sequences.
    Cpu,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("GPU"),
            Self::Cpu => f.write_str("CPU"),
        }
    }
}

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The hash includes the parent block's hash, so blocks holding the same
/// tokens behind different prefixes hash differently.
///
/// # Example
///
/// ```
/// use paged_serve::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Metadata of one physical KV cache block.
///
/// The block's contents live with the compute collaborator; the core only
/// tracks ownership and sharing state.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    device: BlockDevice,
    block_size: usize,
    /// Number of block tables pointing at this block.
    ref_count: usize,
    /// Chained content hash, set once the block is sealed.
    content_hash: Option<u64>,
    /// Tokens covered by `content_hash` (prefix length through this block).
    num_hashed_tokens: usize,
    /// Logical clock of the last allocation or access.
    last_accessed: u64,
    /// KV content has been produced by a compute step.
    computed: bool,
    /// Block is full and immutable.
    sealed: bool,
}

impl Block {
    /// Create a freshly allocated block with a single reference.
    pub fn new(block_id: BlockId, device: BlockDevice, block_size: usize) -> Self {
        Self {
            block_id,
            device,
            block_size,
            ref_count: 1,
            content_hash: None,
            num_hashed_tokens: 0,
            last_accessed: 0,
            computed: false,
            sealed: false,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn device(&self) -> BlockDevice {
        self.device
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn content_hash(&self) -> Option<u64> {
        self.content_hash
    }

    pub fn num_hashed_tokens(&self) -> usize {
        self.num_hashed_tokens
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    pub fn is_computed(&self) -> bool {
        self.computed
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seal the block with its chained content hash.
    pub fn seal(&mut self, content_hash: u64, num_hashed_tokens: usize) {
        self.sealed = true;
        self.content_hash = Some(content_hash);
        self.num_hashed_tokens = num_hashed_tokens;
    }

    pub fn set_computed(&mut self, computed: bool) {
        self.computed = computed;
    }

    pub fn touch(&mut self, tick: u64) {
        self.last_accessed = tick;
    }

    /// Increment reference count (when sharing with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count, returning the new count.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    /// Carry sealing state over from a block whose contents were copied here.
    pub(crate) fn inherit_state(&mut self, src: &Block) {
        self.content_hash = src.content_hash;
        self.num_hashed_tokens = src.num_hashed_tokens;
        self.computed = src.computed;
        self.sealed = src.sealed;
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: position in the sequence (0, 1, 2, ...)
/// - Physical block ID: actual block in the pool named by [`device`](Self::device)
///
/// Token at position `p` is stored in slot `p % block_size` of physical block
/// `block_ids[p / block_size]`. All blocks but the last are full; the last one
/// is the mutable tail.
///
/// # Example
///
/// ```
/// use paged_serve::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone)]
pub struct BlockTable {
    block_ids: Vec<BlockId>,
    block_size: usize,
    device: BlockDevice,
    /// Token slots reserved in the table (may be less than the block capacity).
    num_slots: usize,
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockTable {
    /// Create a new empty GPU block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
            device: BlockDevice::Gpu,
            num_slots: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pool the table's blocks live in.
    pub fn device(&self) -> BlockDevice {
        self.device
    }

    pub(crate) fn set_device(&mut self, device: BlockDevice) {
        self.device = device;
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Point a logical block at a different physical block, returning the old one.
    pub(crate) fn replace_block(&mut self, logical_block_idx: usize, block_id: BlockId) -> Result<BlockId> {
        let num_blocks = self.block_ids.len();
        let slot = self
            .block_ids
            .get_mut(logical_block_idx)
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks,
            })?;
        Ok(std::mem::replace(slot, block_id))
    }

    /// Drop every block past the first `num_blocks`, returning the removed IDs.
    pub(crate) fn truncate_blocks(&mut self, num_blocks: usize) -> Vec<BlockId> {
        if num_blocks >= self.block_ids.len() {
            return Vec::new();
        }
        self.block_ids.split_off(num_blocks)
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// All physical block IDs, in logical order.
    pub fn get_physical_block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// The mutable tail block, if any.
    pub fn last_block_id(&self) -> Option<BlockId> {
        self.block_ids.last().copied()
    }

    /// Token slots currently reserved.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub(crate) fn set_num_slots(&mut self, num_slots: usize) {
        self.num_slots = num_slots;
    }

    /// Token slots the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Token positions covered by a logical block.
    pub fn logical_block_range(&self, logical_block_idx: usize) -> Range<usize> {
        let start = logical_block_idx * self.block_size;
        start..start + self.block_size
    }

    /// Global slot index of every token in `0..seq_len`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`. Positions
    /// past the allocated blocks are omitted.
    pub fn get_slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        self.slot_mapping_range(0, seq_len)
    }

    /// Global slot index of `len` tokens starting at position `start`.
    pub fn slot_mapping_range(&self, start: usize, len: usize) -> Vec<usize> {
        (start..start + len)
            .filter_map(|pos| {
                let logical_block = pos / self.block_size;
                let slot_in_block = pos % self.block_size;
                self.block_ids
                    .get(logical_block)
                    .map(|&physical_block| physical_block * self.block_size + slot_in_block)
            })
            .collect()
    }

    /// Clear all blocks from the table. The caller is responsible for
    /// releasing them.
    pub(crate) fn clear(&mut self) -> Vec<BlockId> {
        self.num_slots = 0;
        std::mem::take(&mut self.block_ids)
    }

    /// Swap the physical block list wholesale (used when moving between pools).
    pub(crate) fn remap(&mut self, device: BlockDevice, block_ids: Vec<BlockId>) {
        self.device = device;
        self.block_ids = block_ids;
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use paged_serve::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_creation() {
        let block = Block::new(42, BlockDevice::Gpu, 16);
        assert_eq!(block.block_id(), 42);
        assert_eq!(block.device(), BlockDevice::Gpu);
        assert_eq!(block.block_size(), 16);
        assert_eq!(block.ref_count(), 1);
        assert!(block.content_hash().is_none());
        assert!(!block.is_sealed());
        assert!(!block.is_computed());
    }

    #[test]
    fn test_block_ref_counting() {
        let mut block = Block::new(0, BlockDevice::Gpu, 16);

        block.increment_ref();
        block.increment_ref();
        assert_eq!(block.ref_count(), 3);

        assert_eq!(block.decrement_ref(), 2);
        assert_eq!(block.decrement_ref(), 1);
        assert_eq!(block.decrement_ref(), 0);

        // Should not go below 0
        assert_eq!(block.decrement_ref(), 0);
    }

    #[test]
    fn test_block_seal() {
        let mut block = Block::new(0, BlockDevice::Cpu, 4);
        block.seal(12345, 8);
        assert!(block.is_sealed());
        assert_eq!(block.content_hash(), Some(12345));
        assert_eq!(block.num_hashed_tokens(), 8);
    }

    #[test]
    fn test_block_table_replace_and_truncate() {
        let mut table = BlockTable::new(4);
        for id in [7, 8, 9] {
            table.append_block(id);
        }

        assert_eq!(table.replace_block(2, 11).unwrap(), 9);
        assert_eq!(table.get_physical_block_ids(), &[7, 8, 11]);
        assert!(table.replace_block(3, 1).is_err());

        assert_eq!(table.truncate_blocks(1), vec![8, 11]);
        assert_eq!(table.truncate_blocks(5), Vec::<BlockId>::new());
        assert_eq!(table.num_blocks(), 1);
    }

    #[test]
    fn test_block_table_slot_mapping() {
        let mut table = BlockTable::new(16);
        table.append_block(5);
        table.append_block(12);

        let slots = table.get_slot_mapping(20);
        assert_eq!(slots.len(), 20);
        assert_eq!(slots[0], 5 * 16);
        assert_eq!(slots[15], 5 * 16 + 15);
        assert_eq!(slots[16], 12 * 16);
        assert_eq!(slots[19], 12 * 16 + 3);

        assert_eq!(table.slot_mapping_range(15, 2), vec![5 * 16 + 15, 12 * 16]);
        // Past the allocation
        assert_eq!(table.slot_mapping_range(31, 3), vec![12 * 16 + 15]);
    }

    #[test]
    fn test_hash_token_block() {
        let tokens = [1u32, 2, 3, 4, 5];
        let hash1 = hash_token_block(&tokens, None);
        let hash2 = hash_token_block(&tokens, Some(999));
        assert_ne!(hash1, hash2);
        assert_eq!(hash2, hash_token_block(&tokens, Some(999)));
        assert_ne!(hash1, hash_token_block(&[1u32, 2, 3, 4, 6], None));
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(100, 16), 7);
    }
}
