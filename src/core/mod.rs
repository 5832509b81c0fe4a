//! Core infrastructure for paged-serve.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockAllocator for one physical pool
//! - PrefixCache for sharing identical prompt blocks
//! - BlockSpaceManager for allocation, copy-on-write and swapping
//! - Sequence and SequenceGroup for request tracking

pub mod block;
pub mod block_allocator;
pub mod block_manager;
pub mod prefix_cache;
pub mod sequence;
