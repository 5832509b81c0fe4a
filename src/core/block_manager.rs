//! Block space manager for the paged KV cache.
//!
//! The `BlockSpaceManager` owns both physical pools and the prefix cache, and
//! performs every mutation of a sequence's [`BlockTable`]:
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   allocate ───► │        GPU BlockAllocator    │ ◄─── append_slots (CoW)
//!   fork     ───► │  [0][1][2][3][4][5][6][7]    │ ◄─── truncate_slots
//!                 └──────────────┬───────────────┘
//!                     swap_out   │   ▲  swap_in
//!                                ▼   │
//!                 ┌──────────────────────────────┐
//!                 │        CPU BlockAllocator    │
//!                 └──────────────────────────────┘
//! ```
//!
//! Every operation checks capacity before touching any table, so a failed
//! allocation never leaves partial state behind. Copy-on-write is lazy: a
//! shared block is copied only when a sequence is about to write into it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::core::block::{compute_num_blocks, hash_token_block, Block, BlockDevice, BlockId, BlockTable};
use crate::core::block_allocator::BlockAllocator;
use crate::core::prefix_cache::{PrefixCache, PrefixCacheStats};
use crate::core::sequence::{Sequence, SequenceGroup};
use crate::engine::executor::BlockSwapper;
use crate::error::{Error, Result};

/// Result of asking whether a group can get the blocks it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    /// Enough blocks are free now.
    Ok,
    /// Not enough free blocks now, but the pool is large enough.
    Later,
    /// The pool can never hold the group.
    Never,
}

/// Source → destination block pairs of a copy.
pub type BlockMapping = Vec<(BlockId, BlockId)>;

/// Owns the GPU and host pools and applies all block-table mutations.
#[derive(Debug)]
pub struct BlockSpaceManager {
    gpu: BlockAllocator,
    cpu: BlockAllocator,
    prefix_cache: Option<PrefixCache>,
    block_size: usize,
    watermark_blocks: usize,
}

impl BlockSpaceManager {
    /// Create a manager over `num_gpu_blocks` device blocks and
    /// `num_cpu_blocks` host blocks.
    pub fn new(
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
        watermark_blocks: usize,
        enable_prefix_caching: bool,
    ) -> Self {
        Self {
            gpu: BlockAllocator::new(BlockDevice::Gpu, num_gpu_blocks, block_size),
            cpu: BlockAllocator::new(BlockDevice::Cpu, num_cpu_blocks, block_size),
            prefix_cache: enable_prefix_caching.then(PrefixCache::new),
            block_size,
            watermark_blocks,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.block_size,
            config.num_gpu_blocks,
            config.num_cpu_blocks,
            config.watermark_blocks,
            config.enable_prefix_caching,
        )
    }

    // ========== Introspection ==========

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn watermark_blocks(&self) -> usize {
        self.watermark_blocks
    }

    pub fn gpu_allocator(&self) -> &BlockAllocator {
        &self.gpu
    }

    pub fn cpu_allocator(&self) -> &BlockAllocator {
        &self.cpu
    }

    pub fn num_free_gpu_blocks(&self) -> usize {
        self.gpu.num_free_blocks()
    }

    pub fn num_free_cpu_blocks(&self) -> usize {
        self.cpu.num_free_blocks()
    }

    pub fn num_used_gpu_blocks(&self) -> usize {
        self.gpu.num_used_blocks()
    }

    pub fn num_used_cpu_blocks(&self) -> usize {
        self.cpu.num_used_blocks()
    }

    /// Reference count of a block, `None` if it is free.
    pub fn ref_count(&self, device: BlockDevice, block_id: BlockId) -> Option<usize> {
        self.pool(device).ref_count(block_id)
    }

    pub fn get_block(&self, device: BlockDevice, block_id: BlockId) -> Option<&Block> {
        self.pool(device).get_block(block_id)
    }

    pub fn prefix_caching_enabled(&self) -> bool {
        self.prefix_cache.is_some()
    }

    pub fn prefix_cache_stats(&self) -> PrefixCacheStats {
        self.prefix_cache
            .as_ref()
            .map(PrefixCache::stats)
            .unwrap_or_default()
    }

    fn pool(&self, device: BlockDevice) -> &BlockAllocator {
        match device {
            BlockDevice::Gpu => &self.gpu,
            BlockDevice::Cpu => &self.cpu,
        }
    }

    fn pool_mut(&mut self, device: BlockDevice) -> &mut BlockAllocator {
        match device {
            BlockDevice::Gpu => &mut self.gpu,
            BlockDevice::Cpu => &mut self.cpu,
        }
    }

    /// GPU blocks usable by sequences once the watermark is set aside.
    fn usable_gpu_blocks(&self) -> usize {
        self.gpu.num_blocks().saturating_sub(self.watermark_blocks)
    }

    fn classify(&self, required: usize, free: usize) -> AllocationStatus {
        if required > self.usable_gpu_blocks() {
            AllocationStatus::Never
        } else if free < required + self.watermark_blocks {
            AllocationStatus::Later
        } else {
            AllocationStatus::Ok
        }
    }

    // ========== Admission ==========

    /// Blocks needed to admit a waiting group.
    ///
    /// A group that has not generated anything is allocated once and forked
    /// to its siblings; otherwise every sequence gets its own blocks.
    pub fn blocks_for_admission(&self, group: &SequenceGroup) -> usize {
        if group.is_fresh() {
            group
                .unfinished_seqs()
                .next()
                .map_or(0, |seq| compute_num_blocks(seq.total_len(), self.block_size))
        } else {
            group
                .unfinished_seqs()
                .map(|seq| compute_num_blocks(seq.total_len(), self.block_size))
                .sum()
        }
    }

    /// Check whether a waiting group can be admitted.
    pub fn can_allocate(&self, group: &SequenceGroup) -> AllocationStatus {
        self.classify(self.blocks_for_admission(group), self.gpu.num_free_blocks())
    }

    /// Allocate GPU blocks for every unfinished sequence of a waiting group.
    ///
    /// Full prompt blocks are looked up in the prefix cache first. Leading
    /// hits whose KV content is already computed are marked as computed on
    /// the sequence, leaving at least one token to process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] without side effects if the GPU
    /// pool cannot hold the group.
    pub fn allocate(&mut self, group: &mut SequenceGroup) -> Result<()> {
        let required = self.blocks_for_admission(group);
        if !self.gpu.can_allocate(required) {
            return Err(Error::AllocationFailure {
                device: BlockDevice::Gpu,
                requested: required,
                available: self.gpu.num_free_blocks(),
            });
        }

        let fresh = group.is_fresh();
        let mut leader_table: Option<BlockTable> = None;
        for seq in group.unfinished_seqs_mut() {
            match &leader_table {
                Some(table) if fresh => {
                    *seq.block_table_mut() = self.fork_table(table)?;
                }
                _ => {
                    self.allocate_seq(seq)?;
                    if fresh {
                        leader_table = Some(seq.block_table().clone());
                    }
                }
            }
        }

        debug!(
            group_id = group.group_id(),
            blocks = required,
            free = self.gpu.num_free_blocks(),
            "Allocated group"
        );
        Ok(())
    }

    fn allocate_seq(&mut self, seq: &mut Sequence) -> Result<()> {
        let tokens = seq.all_token_ids();
        let prompt_len = seq.prompt_len();
        let block_size = self.block_size;

        let mut parent_hash = None;
        let mut parent_block = None;
        let mut cached_tokens = 0;
        let mut leading_hits = true;

        let table = seq.block_table_mut();
        table.set_device(BlockDevice::Gpu);
        for (idx, chunk) in tokens.chunks(block_size).enumerate() {
            let end = idx * block_size + chunk.len();
            let cacheable = chunk.len() == block_size && end <= prompt_len;

            let block_id = if cacheable {
                let hash = hash_token_block(chunk, parent_hash);
                parent_hash = Some(hash);
                let (block_id, computed) = self.allocate_prompt_block(hash, parent_block, chunk, end)?;
                if leading_hits && computed {
                    cached_tokens = end;
                } else {
                    leading_hits = false;
                }
                block_id
            } else {
                leading_hits = false;
                self.gpu.allocate()?
            };

            table.append_block(block_id);
            parent_block = Some(block_id);
        }
        table.set_num_slots(tokens.len());

        let skip = cached_tokens.min(tokens.len().saturating_sub(1));
        if skip > 0 {
            trace!(seq_id = seq.seq_id(), skip, "Prefix cache hit");
            seq.mark_computed(skip);
        }
        Ok(())
    }

    /// Allocate or share one full prompt block. Returns the block and whether
    /// its KV content is already computed.
    fn allocate_prompt_block(
        &mut self,
        hash: u64,
        parent: Option<BlockId>,
        tokens: &[u32],
        num_hashed_tokens: usize,
    ) -> Result<(BlockId, bool)> {
        let Some(cache) = self.prefix_cache.as_mut() else {
            let block_id = self.gpu.allocate()?;
            self.gpu.get_block_mut(block_id)?.seal(hash, num_hashed_tokens);
            return Ok((block_id, false));
        };

        match cache.lookup(hash, parent, tokens) {
            Ok(Some(block_id)) => {
                self.gpu.fork(block_id)?;
                let computed = self.gpu.get_block(block_id).is_some_and(Block::is_computed);
                Ok((block_id, computed))
            }
            Ok(None) => {
                let block_id = self.gpu.allocate()?;
                self.gpu.get_block_mut(block_id)?.seal(hash, num_hashed_tokens);
                cache.register(hash, block_id, parent, tokens);
                Ok((block_id, false))
            }
            Err(Error::PrefixCacheCollision { hash }) => {
                warn!(hash, "Prefix cache hash collision, allocating a fresh block");
                let block_id = self.gpu.allocate()?;
                self.gpu.get_block_mut(block_id)?.seal(hash, num_hashed_tokens);
                Ok((block_id, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Share every block of `table` with a new table (copy-on-write).
    pub fn fork_table(&mut self, table: &BlockTable) -> Result<BlockTable> {
        for &block_id in table.get_physical_block_ids() {
            self.pool_mut(table.device()).fork(block_id)?;
        }
        Ok(table.clone())
    }

    // ========== Growth ==========

    /// GPU blocks `seq` needs to hold `num_slots` token slots, counting
    /// copy-on-write copies of shared blocks in its write range.
    pub fn blocks_to_append(&self, seq: &Sequence, num_slots: usize) -> usize {
        let table = seq.block_table();
        let target_blocks = compute_num_blocks(num_slots, self.block_size);
        let new_blocks = target_blocks.saturating_sub(table.num_blocks());

        let first = seq.num_computed_tokens() / self.block_size;
        let last = target_blocks.min(table.num_blocks());
        let copies = (first..last)
            .filter_map(|idx| table.get_block_id(idx).ok())
            .filter(|&id| self.gpu.ref_count(id).unwrap_or(0) > 1)
            .count();

        new_blocks + copies
    }

    /// Reserve `num_slots` token slots in `seq`'s table.
    ///
    /// Shared blocks the sequence is about to write into are replaced with
    /// private copies first.
    ///
    /// # Returns
    ///
    /// The `(source, destination)` copies the compute step must apply before
    /// writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] without side effects if the GPU
    /// pool is too small.
    pub fn append_slots(&mut self, seq: &mut Sequence, num_slots: usize) -> Result<BlockMapping> {
        let needed = self.blocks_to_append(seq, num_slots);
        if !self.gpu.can_allocate(needed) {
            return Err(Error::AllocationFailure {
                device: BlockDevice::Gpu,
                requested: needed,
                available: self.gpu.num_free_blocks(),
            });
        }

        let seq_id = seq.seq_id();
        let first = seq.num_computed_tokens() / self.block_size;
        let target_blocks = compute_num_blocks(num_slots, self.block_size);
        let table = seq.block_table_mut();

        let mut copies = Vec::new();
        for idx in first..target_blocks.min(table.num_blocks()) {
            let block_id = table.get_block_id(idx)?;
            if self.gpu.ref_count(block_id).unwrap_or(0) <= 1 {
                continue;
            }
            let src = self.gpu.get_block(block_id).cloned();
            let new_id = self.gpu.allocate()?;
            if let Some(src) = src {
                self.gpu.get_block_mut(new_id)?.inherit_state(&src);
            }
            self.gpu.free(block_id)?;
            table.replace_block(idx, new_id)?;
            trace!(seq_id, from = block_id, to = new_id, "Copy-on-write");
            copies.push((block_id, new_id));
        }

        while table.num_blocks() < target_blocks {
            table.append_block(self.gpu.allocate()?);
        }
        if num_slots > table.num_slots() {
            table.set_num_slots(num_slots);
        }

        Ok(copies)
    }

    /// Shrink `seq`'s reservation to `num_slots`, releasing whole blocks past it.
    ///
    /// # Returns
    ///
    /// The block IDs dropped from the table.
    pub fn truncate_slots(&mut self, seq: &mut Sequence, num_slots: usize) -> Result<Vec<BlockId>> {
        let keep = compute_num_blocks(num_slots, self.block_size);
        let table = seq.block_table_mut();
        let device = table.device();
        let removed = table.truncate_blocks(keep);
        table.set_num_slots(num_slots.min(table.num_slots()));

        for &block_id in &removed {
            self.release(device, block_id)?;
        }
        if !removed.is_empty() {
            trace!(seq_id = seq.seq_id(), released = removed.len(), "Truncated reservation");
        }
        Ok(removed)
    }

    /// Seal and mark computed every full block covered by `seq`'s computed tokens.
    ///
    /// Sealed blocks get a chained content hash. Prompt blocks were hashed
    /// and registered at admission; generated blocks are hashed but never
    /// registered in the prefix cache.
    ///
    /// # Returns
    ///
    /// Number of newly sealed blocks.
    pub fn seal_completed_blocks(&mut self, seq: &Sequence) -> Result<usize> {
        let table = seq.block_table();
        if table.device() != BlockDevice::Gpu {
            return Ok(0);
        }

        let full_blocks = (seq.num_computed_tokens() / self.block_size).min(table.num_blocks());
        let mut parent_hash = None;
        let mut sealed = 0;
        for idx in 0..full_blocks {
            let block_id = table.get_block_id(idx)?;
            let block = self.gpu.get_block_mut(block_id)?;
            if !block.is_sealed() {
                let range = table.logical_block_range(idx);
                let tokens = seq.token_range(range.start, range.end);
                block.seal(hash_token_block(&tokens, parent_hash), range.end);
                sealed += 1;
            }
            block.set_computed(true);
            parent_hash = block.content_hash();
        }
        Ok(sealed)
    }

    // ========== Swapping ==========

    /// Distinct blocks held by a group's unfinished sequences.
    pub fn num_group_blocks(group: &SequenceGroup) -> usize {
        Self::group_blocks(group).len()
    }

    /// Distinct blocks held by a group's unfinished sequences, first-seen order.
    fn group_blocks(group: &SequenceGroup) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        group
            .unfinished_seqs()
            .flat_map(|seq| seq.block_table().get_physical_block_ids().iter().copied())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Check whether the host pool can take a running group.
    pub fn can_swap_out(&self, group: &SequenceGroup) -> bool {
        self.cpu.can_allocate(Self::group_blocks(group).len())
    }

    /// Check whether a swapped group can return to the GPU.
    ///
    /// Only a group holding more blocks than the whole pool is `Never`. Beyond
    /// its own blocks it waits for one block per sequence for the next append
    /// plus the watermark, capped so an otherwise empty pool always takes it
    /// back.
    pub fn can_swap_in(&self, group: &SequenceGroup) -> AllocationStatus {
        let held = Self::group_blocks(group).len();
        let capacity = self.gpu.num_blocks();
        if held > capacity {
            return AllocationStatus::Never;
        }
        let headroom = (group.num_unfinished_seqs() + self.watermark_blocks).min(capacity - held);
        if self.gpu.num_free_blocks() < held + headroom {
            AllocationStatus::Later
        } else {
            AllocationStatus::Ok
        }
    }

    /// Move a group's blocks to the host pool.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the host pool is too small and
    /// [`Error::SwapFailure`] if a copy fails. Either way the group keeps its
    /// GPU blocks.
    pub fn swap_out(&mut self, group: &mut SequenceGroup, swapper: &mut dyn BlockSwapper) -> Result<BlockMapping> {
        let mapping = self.move_group(group, BlockDevice::Gpu, BlockDevice::Cpu, swapper)?;
        debug!(group_id = group.group_id(), blocks = mapping.len(), "Swapped out");
        Ok(mapping)
    }

    /// Move a swapped group's blocks back to the GPU pool.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the GPU pool is too small and
    /// [`Error::SwapFailure`] if a copy fails. Either way the group keeps its
    /// host blocks.
    pub fn swap_in(&mut self, group: &mut SequenceGroup, swapper: &mut dyn BlockSwapper) -> Result<BlockMapping> {
        let mapping = self.move_group(group, BlockDevice::Cpu, BlockDevice::Gpu, swapper)?;
        debug!(group_id = group.group_id(), blocks = mapping.len(), "Swapped in");
        Ok(mapping)
    }

    fn move_group(
        &mut self,
        group: &mut SequenceGroup,
        from: BlockDevice,
        to: BlockDevice,
        swapper: &mut dyn BlockSwapper,
    ) -> Result<BlockMapping> {
        let sources = Self::group_blocks(group);
        let destinations = self.pool_mut(to).allocate_many(sources.len())?;
        let mapping: BlockMapping = sources.iter().copied().zip(destinations.iter().copied()).collect();

        for &(src, dst) in &mapping {
            if let Err(err) = swapper.copy((from, src), (to, dst)) {
                self.pool_mut(to).free_many(&destinations)?;
                return Err(match err {
                    Error::SwapFailure(_) => err,
                    other => Error::SwapFailure(other.to_string()),
                });
            }
            let state = self.pool(from).get_block(src).cloned();
            if let Some(state) = state {
                self.pool_mut(to).get_block_mut(dst)?.inherit_state(&state);
            }
        }

        // Copy is confirmed; rewrite the tables. Allocation holds the first
        // reference of each destination block, every further table forks it.
        let lookup: HashMap<BlockId, BlockId> = mapping.iter().copied().collect();
        let mut referenced = HashSet::new();
        for seq in group.unfinished_seqs_mut() {
            let old_ids = seq.block_table().get_physical_block_ids().to_vec();
            let mut new_ids = Vec::with_capacity(old_ids.len());
            for &old in &old_ids {
                let new = lookup
                    .get(&old)
                    .copied()
                    .ok_or(Error::BlockNotAllocated { device: from, block_id: old })?;
                if !referenced.insert(new) {
                    self.pool_mut(to).fork(new)?;
                }
                new_ids.push(new);
            }
            for &old in &old_ids {
                self.release(from, old)?;
            }
            seq.block_table_mut().remap(to, new_ids);
        }

        Ok(mapping)
    }

    // ========== Release ==========

    fn release(&mut self, device: BlockDevice, block_id: BlockId) -> Result<bool> {
        let freed = self.pool_mut(device).free(block_id)?;
        if freed && device == BlockDevice::Gpu {
            if let Some(cache) = self.prefix_cache.as_mut() {
                cache.remove_block(block_id);
            }
        }
        Ok(freed)
    }

    /// Release every block of `seq`'s table and clear it.
    pub fn free_seq(&mut self, seq: &mut Sequence) -> Result<()> {
        let table = seq.block_table_mut();
        let device = table.device();
        let block_ids = table.clear();
        table.set_device(BlockDevice::Gpu);
        for block_id in block_ids {
            self.release(device, block_id)?;
        }
        Ok(())
    }

    /// Release the blocks of every sequence in a group.
    pub fn free_group(&mut self, group: &mut SequenceGroup) -> Result<()> {
        for seq in group.sequences_mut() {
            self.free_seq(seq)?;
        }
        Ok(())
    }

    /// Free everything in both pools and forget the prefix cache.
    pub fn reset(&mut self) {
        self.gpu.reset();
        self.cpu.reset();
        if let Some(cache) = self.prefix_cache.as_mut() {
            cache.clear();
        }
    }
}
