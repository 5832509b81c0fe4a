//! Sequence tracking for inference requests.
//!
//! A [`Sequence`] is one stream of generated tokens with its own block table.
//! A [`SequenceGroup`] is the set of sequences sampled from one prompt
//! (`n`-best); admission and budgeting work on groups, cache mutation on
//! sequences.

use std::time::Instant;

use crate::config::SamplingConfig;
use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Unique identifier for a sequence group (one request).
pub type GroupId = u64;

/// Priority level for scheduling. Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Blocks moved to host memory (preempted by swap).
    Swapped,
    /// Finished generation.
    Finished,
    /// Cancelled by the caller.
    Aborted,
}

impl SequenceStatus {
    /// Check if the sequence is active (waiting or running).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Check if the sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Swapped => "Swapped",
            Self::Finished => "Finished",
            Self::Aborted => "Aborted",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The compute step reported end of sequence.
    EndOfSequence,
    /// A configured stop token was generated.
    StopToken,
    /// Maximum token limit reached.
    MaxTokens,
    /// Sequence reached the model's maximum length.
    MaxModelLen,
    /// Aborted by the caller.
    Aborted,
    /// The sequence can never fit in the GPU pool.
    CapacityExceeded,
}

/// Whether a scheduled sequence processes its prompt or generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    Prefill,
    Decode,
}

/// A single generation stream.
///
/// It tracks:
/// - Prompt and generated tokens
/// - How many of them have KV entries in the cache
/// - Its block table
/// - Draft tokens proposed but not yet verified
///
/// # Example
///
/// ```
/// use paged_serve::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, 1, vec![1, 2, 3, 4], 16);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    group_id: GroupId,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    block_table: BlockTable,
    /// Leading tokens whose KV entries are in the cache.
    num_computed_tokens: usize,
    status: SequenceStatus,
    finish_reason: Option<FinishReason>,
    /// Draft tokens under verification this step.
    pending_proposal: Vec<u32>,
}

impl Sequence {
    /// Create a waiting sequence with the given prompt tokens.
    pub fn new(
        seq_id: SequenceId,
        group_id: GroupId,
        prompt_token_ids: Vec<u32>,
        block_size: usize,
    ) -> Self {
        Self {
            seq_id,
            group_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: BlockTable::new(block_size),
            num_computed_tokens: 0,
            status: SequenceStatus::Waiting,
            finish_reason: None,
            pending_proposal: Vec::new(),
        }
    }

    // ========== Getters ==========

    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Token at absolute position `pos` (prompt first, then output).
    pub fn token_at(&self, pos: usize) -> Option<u32> {
        if pos < self.prompt_token_ids.len() {
            Some(self.prompt_token_ids[pos])
        } else {
            self.output_token_ids
                .get(pos - self.prompt_token_ids.len())
                .copied()
        }
    }

    /// Tokens in `start..end` (prompt first, then output), clamped to the length.
    pub fn token_range(&self, start: usize, end: usize) -> Vec<u32> {
        (start..end.min(self.total_len()))
            .filter_map(|pos| self.token_at(pos))
            .collect()
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn pending_proposal(&self) -> &[u32] {
        &self.pending_proposal
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens not yet written to the cache.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.total_len().saturating_sub(self.num_computed_tokens)
    }

    /// Prefill while more than the newest token is missing from the cache,
    /// or nothing has been computed yet.
    pub fn phase(&self) -> SequencePhase {
        if self.num_computed_tokens == 0 || self.num_uncomputed_tokens() > 1 {
            SequencePhase::Prefill
        } else {
            SequencePhase::Decode
        }
    }

    pub fn is_prefill(&self) -> bool {
        self.phase() == SequencePhase::Prefill
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Mark `num_tokens` more tokens as written to the cache.
    pub fn mark_computed(&mut self, num_tokens: usize) {
        self.num_computed_tokens = (self.num_computed_tokens + num_tokens).min(self.total_len());
    }

    pub(crate) fn set_pending_proposal(&mut self, tokens: Vec<u32>) {
        self.pending_proposal = tokens;
    }

    pub(crate) fn take_pending_proposal(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pending_proposal)
    }

    /// Forget all cache state so the sequence is recomputed from its tokens.
    ///
    /// Tokens already generated are kept: they have been returned to the caller.
    /// The caller must have released the block table's blocks.
    pub(crate) fn reset_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.pending_proposal.clear();
        self.block_table.clear();
    }

    // ========== State transitions ==========

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting (preempted by recompute).
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running | SequenceStatus::Swapped => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Transition to swapped state (preempted by swap).
    pub fn set_swapped(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Swapped;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Swapped",
            }),
        }
    }

    /// Mark the sequence as finished. Aborts get the `Aborted` status.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = if reason == FinishReason::Aborted {
            SequenceStatus::Aborted
        } else {
            SequenceStatus::Finished
        };
        self.finish_reason = Some(reason);
        self.pending_proposal.clear();
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}

/// The sequences generated from one request.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    group_id: GroupId,
    sequences: Vec<Sequence>,
    sampling: SamplingConfig,
    priority: Priority,
    /// Monotonic admission order; ties are always broken by this.
    arrival_order: u64,
    arrival_time: Instant,
}

impl SequenceGroup {
    /// Create a group of `sampling.n` waiting sequences with consecutive ids
    /// starting at `first_seq_id`.
    pub fn new(
        group_id: GroupId,
        first_seq_id: SequenceId,
        prompt_token_ids: Vec<u32>,
        sampling: SamplingConfig,
        block_size: usize,
    ) -> Self {
        let n = sampling.n.max(1) as u64;
        let sequences = (0..n)
            .map(|i| Sequence::new(first_seq_id + i, group_id, prompt_token_ids.clone(), block_size))
            .collect();

        Self {
            group_id,
            sequences,
            sampling,
            priority: DEFAULT_PRIORITY,
            arrival_order: group_id,
            arrival_time: Instant::now(),
        }
    }

    /// Set request priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    pub(crate) fn set_arrival_order(&mut self, arrival_order: u64) {
        self.arrival_order = arrival_order;
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn prompt_len(&self) -> usize {
        self.sequences.first().map_or(0, Sequence::prompt_len)
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub(crate) fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    pub fn get_seq(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.seq_id() == seq_id)
    }

    pub fn get_seq_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Sequences in the given status, in id order.
    pub fn seqs_with_status(&self, status: SequenceStatus) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(move |s| s.status() == status)
    }

    /// Sequences that have not reached a terminal state.
    pub fn unfinished_seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| !s.status().is_finished())
    }

    pub(crate) fn unfinished_seqs_mut(&mut self) -> impl Iterator<Item = &mut Sequence> {
        self.sequences.iter_mut().filter(|s| !s.status().is_finished())
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.unfinished_seqs().count()
    }

    /// Every sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.sequences.iter().all(|s| s.status().is_finished())
    }

    /// All unfinished sequences are still at their prompt (nothing generated).
    pub fn is_fresh(&self) -> bool {
        self.unfinished_seqs().all(|s| s.output_len() == 0)
    }

    /// First unfinished sequence; it prefills on behalf of forked siblings.
    pub fn leader(&self) -> Option<&Sequence> {
        self.unfinished_seqs().next()
    }

    /// A sibling forked at admission waits until the leader has prefilled
    /// the shared prompt blocks.
    pub fn is_waiting_on_leader(&self, seq: &Sequence) -> bool {
        if seq.num_computed_tokens() > 0 || seq.output_len() > 0 {
            return false;
        }
        self.leader()
            .is_some_and(|leader| leader.seq_id() != seq.seq_id() && leader.output_len() == 0)
    }

    /// Once the leader has its first token, the shared prompt KV is in place
    /// for every follower; they only need to process the last prompt token.
    pub(crate) fn release_followers(&mut self) {
        let Some(leader) = self.leader() else {
            return;
        };
        if leader.output_len() == 0 {
            return;
        }
        let leader_id = leader.seq_id();
        for seq in self.unfinished_seqs_mut() {
            if seq.seq_id() != leader_id && seq.num_computed_tokens() == 0 && seq.output_len() == 0 {
                let prompt_len = seq.prompt_len();
                seq.mark_computed(prompt_len.saturating_sub(1));
            }
        }
    }
}
