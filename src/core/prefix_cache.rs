//! Content-addressed lookup of sealed prompt blocks.
//!
//! When many requests share a system prompt, the KV blocks for that prefix
//! only need to be computed once. The cache maps the chained hash of a full
//! prompt block to the GPU block holding it.
//!
//! ```text
//! Request A: [sys prompt | block 0][sys prompt | block 1][question A...]
//! Request B: [sys prompt | block 0][sys prompt | block 1][question B...]
//!                  │                      │
//!                  └──── same physical blocks, ref_count = 2 ────┘
//! ```
//!
//! A hash match alone is never trusted: the stored token content and the
//! parent block are compared exactly, and a mismatch is reported as
//! [`Error::PrefixCacheCollision`] so the caller can fall back to a fresh
//! allocation.

use std::collections::HashMap;

use crate::core::block::BlockId;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct CachedBlock {
    block_id: BlockId,
    /// Block holding the preceding prompt tokens, `None` for the first block.
    parent: Option<BlockId>,
    token_ids: Vec<u32>,
}

/// Prefix cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrefixCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub collisions: u64,
}

impl PrefixCacheStats {
    /// Fraction of lookups that were hits.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.collisions;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Hash → sealed block map with exact-content verification.
#[derive(Debug, Default)]
pub struct PrefixCache {
    entries: HashMap<u64, CachedBlock>,
    /// Reverse index so a freed block can be dropped from the cache.
    block_hashes: HashMap<BlockId, u64>,
    stats: PrefixCacheStats,
}

impl PrefixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the block registered under `hash`.
    ///
    /// The caller is responsible for taking a reference on a hit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PrefixCacheCollision`] when the hash is registered for
    /// different content.
    pub fn lookup(
        &mut self,
        hash: u64,
        parent: Option<BlockId>,
        token_ids: &[u32],
    ) -> Result<Option<BlockId>> {
        match self.entries.get(&hash) {
            None => {
                self.stats.misses += 1;
                Ok(None)
            }
            Some(entry) if entry.parent == parent && entry.token_ids == token_ids => {
                self.stats.hits += 1;
                Ok(Some(entry.block_id))
            }
            Some(_) => {
                self.stats.collisions += 1;
                Err(Error::PrefixCacheCollision { hash })
            }
        }
    }

    /// Register a sealed block under `hash`.
    ///
    /// Returns `false` if the hash or the block is already registered; the
    /// first registration wins.
    pub fn register(
        &mut self,
        hash: u64,
        block_id: BlockId,
        parent: Option<BlockId>,
        token_ids: &[u32],
    ) -> bool {
        if self.entries.contains_key(&hash) || self.block_hashes.contains_key(&block_id) {
            return false;
        }
        self.entries.insert(
            hash,
            CachedBlock {
                block_id,
                parent,
                token_ids: token_ids.to_vec(),
            },
        );
        self.block_hashes.insert(block_id, hash);
        true
    }

    /// Drop the entry for a block that is being freed or moved off the GPU.
    pub fn remove_block(&mut self, block_id: BlockId) -> Option<u64> {
        let hash = self.block_hashes.remove(&block_id)?;
        self.entries.remove(&hash);
        Some(hash)
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Hash a block is registered under, if any.
    pub fn hash_of(&self, block_id: BlockId) -> Option<u64> {
        self.block_hashes.get(&block_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PrefixCacheStats {
        self.stats
    }

    /// Forget every entry. Blocks themselves are not freed.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.block_hashes.clear();
    }
}
