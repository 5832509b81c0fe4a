//! Collaborator contracts.
//!
//! The engine drives three external collaborators through synchronous
//! request/response calls. Whatever runs behind them (device streams,
//! DMA engines, a remote draft model) must have finished its memory effects
//! before a call returns.

use crate::core::block::{BlockDevice, BlockId};
use crate::core::sequence::SequenceId;
use crate::error::Result;
use crate::scheduler::SchedulerOutputs;

/// What the compute collaborator receives each step: the scheduled
/// sequences with their block tables, slot mappings and phases, plus the
/// copy-on-write copies to apply first.
pub type BatchDescriptor = SchedulerOutputs;

/// Result of the forward pass for one scheduled sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceOutput {
    pub seq_id: SequenceId,
    /// Token sampled at the newest position. Required when the sequence
    /// samples and carries no draft tokens.
    pub token_id: Option<u32>,
    /// Target distributions for verification: one row per draft token plus
    /// one for the bonus position. Empty without draft tokens.
    pub target_probs: Vec<Vec<f32>>,
}

impl SequenceOutput {
    /// Output of a step that sampled one token.
    pub fn token(seq_id: SequenceId, token_id: u32) -> Self {
        Self {
            seq_id,
            token_id: Some(token_id),
            target_probs: Vec::new(),
        }
    }

    /// Output of an intermediate prefill chunk.
    pub fn empty(seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            ..Default::default()
        }
    }
}

/// Draft tokens and the draft's distribution at each of their positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftProposal {
    pub token_ids: Vec<u32>,
    /// `probs[i]` is the draft distribution `token_ids[i]` was sampled from.
    pub probs: Vec<Vec<f32>>,
}

impl DraftProposal {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Forward pass over a scheduled batch.
pub trait ModelExecutor: Send {
    /// Run one step. Returns one output per scheduled sequence.
    fn run_step(&mut self, batch: &BatchDescriptor) -> Result<Vec<SequenceOutput>>;
}

/// Draft model used by speculative decoding.
pub trait DraftProposer: Send {
    /// Propose up to `k` tokens continuing `context`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DraftUnavailable`] when no proposal can be made for
    /// this sequence; it then decodes one token normally.
    fn propose(&mut self, seq_id: SequenceId, context: &[u32], k: usize) -> Result<DraftProposal>;
}

/// Copies one block between pools. Returns once the copy is complete.
pub trait BlockSwapper: Send {
    fn copy(&mut self, src: (BlockDevice, BlockId), dst: (BlockDevice, BlockId)) -> Result<()>;
}
