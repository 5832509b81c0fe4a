//! Error types for paged-serve.

use thiserror::Error;

use crate::core::block::BlockDevice;

/// Result type alias for paged-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paged-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free blocks in a pool. Recoverable: the scheduler treats it
    /// as "this sequence cannot advance this step".
    #[error("out of {device} KV cache blocks: requested {requested}, {available} free")]
    AllocationFailure {
        device: BlockDevice,
        requested: usize,
        available: usize,
    },

    /// A request needs more blocks than the whole GPU pool holds.
    #[error("sequence group {group_id} needs {required_blocks} blocks but the pool holds {capacity}")]
    CapacityExceeded {
        group_id: u64,
        required_blocks: usize,
        capacity: usize,
    },

    /// A prefix-cache hash matched a block whose token content differs.
    #[error("prefix cache collision on hash {hash:#018x}")]
    PrefixCacheCollision { hash: u64 },

    /// Host/device block copy failed.
    #[error("swap failed: {0}")]
    SwapFailure(String),

    /// The draft collaborator could not produce a proposal.
    #[error("draft proposal unavailable for sequence {seq_id}: {reason}")]
    DraftUnavailable { seq_id: u64, reason: String },

    /// A probability distribution that cannot be sampled from.
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    /// The compute collaborator failed.
    #[error("executor error: {0}")]
    Executor(String),

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Sequence group not found in scheduler.
    #[error("sequence group {0} not found")]
    GroupNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Freeing or forking a block that is not allocated.
    #[error("{device} block {block_id} is not allocated")]
    BlockNotAllocated { device: BlockDevice, block_id: usize },

    /// Logical block index past the end of a block table.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} blocks)")]
    BlockIndexOutOfBounds { logical_idx: usize, num_blocks: usize },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is an allocation failure the scheduler can recover from.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::AllocationFailure { .. })
    }
}
