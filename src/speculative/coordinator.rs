//! Draft/verify coordination.
//!
//! Per step, for every decoding sequence that got lookahead slots:
//!
//! ```text
//!   propose ──► tentative extension ──► target pass ──► verify ──► reconcile
//!   (draft)     (slots L..L+k held)     (executor)      (reject.   (keep L+a,
//!                                                        sampler)   free rest)
//! ```
//!
//! The scheduler reserves the lookahead slots like any decode growth. The
//! coordinator remembers which of them are tentative so that rejected or
//! unused slots go back to the allocator.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::config::SpeculativeConfig;
use super::sampler::{RejectionSampler, Verification};
use crate::core::block_manager::BlockSpaceManager;
use crate::core::sequence::{Sequence, SequenceId};
use crate::engine::executor::{DraftProposal, DraftProposer};
use crate::error::{Error, Result};

/// Running counters of speculative decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpecDecodeStats {
    /// Proposals verified.
    pub num_drafts: u64,
    /// Draft tokens verified.
    pub num_draft_tokens: u64,
    /// Draft tokens accepted.
    pub num_accepted_tokens: u64,
    /// Tokens committed to sequences after verification, at most accepted plus one.
    pub num_emitted_tokens: u64,
    /// Sequences that fell back to plain decoding.
    pub num_fallbacks: u64,
}

impl SpecDecodeStats {
    /// Fraction of draft tokens accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_draft_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_draft_tokens as f64
        }
    }

    /// Tokens committed per verification pass.
    pub fn mean_emitted_per_verification(&self) -> f64 {
        if self.num_drafts == 0 {
            0.0
        } else {
            self.num_emitted_tokens as f64 / self.num_drafts as f64
        }
    }
}

/// Draft awaiting verification.
#[derive(Debug, Clone)]
struct PendingDraft {
    proposal: DraftProposal,
    /// Slots backed by committed tokens when the draft was made.
    confirmed_slots: usize,
}

/// Result of committing a verified draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub verification: Verification,
    /// Blocks released from the tentative extension.
    pub released_blocks: usize,
}

/// Drives proposal, verification and cache reconciliation.
#[derive(Debug)]
pub struct SpeculativeCoordinator {
    config: SpeculativeConfig,
    sampler: RejectionSampler,
    pending: HashMap<SequenceId, PendingDraft>,
    stats: SpecDecodeStats,
}

impl SpeculativeCoordinator {
    pub fn new(config: SpeculativeConfig) -> Self {
        let sampler = match config.seed {
            Some(seed) => RejectionSampler::with_seed(seed),
            None => RejectionSampler::new(),
        };
        Self {
            config,
            sampler,
            pending: HashMap::new(),
            stats: SpecDecodeStats::default(),
        }
    }

    pub fn config(&self) -> &SpeculativeConfig {
        &self.config
    }

    pub fn num_speculative_tokens(&self) -> usize {
        self.config.num_speculative_tokens
    }

    pub fn stats(&self) -> SpecDecodeStats {
        self.stats
    }

    pub fn has_pending(&self, seq_id: SequenceId) -> bool {
        self.pending.contains_key(&seq_id)
    }

    /// Ask the draft for up to `k` tokens and hold them as a tentative
    /// extension of `seq`, whose table already reserves the lookahead slots.
    ///
    /// Unused reserved slots (an unavailable draft, or a short proposal) are
    /// released right away.
    ///
    /// # Returns
    ///
    /// The proposed tokens; empty when `seq` falls back to plain decoding.
    pub fn propose(
        &mut self,
        draft: &mut dyn DraftProposer,
        manager: &mut BlockSpaceManager,
        seq: &mut Sequence,
        k: usize,
    ) -> Result<Vec<u32>> {
        let seq_id = seq.seq_id();
        let confirmed_slots = seq.total_len();

        let proposal = match draft.propose(seq_id, &seq.all_token_ids(), k) {
            Ok(mut proposal) => {
                if proposal.probs.len() != proposal.token_ids.len() {
                    return Err(Error::InvalidDistribution(format!(
                        "draft returned {} tokens with {} distributions",
                        proposal.token_ids.len(),
                        proposal.probs.len()
                    )));
                }
                proposal.token_ids.truncate(k);
                proposal.probs.truncate(k);
                proposal
            }
            Err(Error::DraftUnavailable { reason, .. }) => {
                warn!(seq_id, %reason, "Draft unavailable, decoding without speculation");
                self.stats.num_fallbacks += 1;
                DraftProposal::default()
            }
            Err(err) => return Err(err),
        };

        manager.truncate_slots(seq, confirmed_slots + proposal.len())?;
        if proposal.is_empty() {
            return Ok(Vec::new());
        }

        trace!(seq_id, num_tokens = proposal.len(), "Drafted");
        let tokens = proposal.token_ids.clone();
        seq.set_pending_proposal(tokens.clone());
        self.pending.insert(
            seq_id,
            PendingDraft {
                proposal,
                confirmed_slots,
            },
        );
        Ok(tokens)
    }

    /// Verify the pending draft of `seq` and shrink its tentative extension
    /// to the accepted length.
    ///
    /// Slots for the confirmed history plus the accepted drafts stay; the
    /// final token's slot is reserved again by the next decode step.
    pub fn verify_and_reconcile(
        &mut self,
        manager: &mut BlockSpaceManager,
        seq: &mut Sequence,
        target_probs: &[Vec<f32>],
    ) -> Result<Reconciliation> {
        let seq_id = seq.seq_id();
        let Some(pending) = self.pending.get(&seq_id) else {
            return Err(Error::DraftUnavailable {
                seq_id,
                reason: "no pending proposal".into(),
            });
        };
        // A rejected verification leaves the proposal pending for `cancel`.
        let verification = self.sampler.verify(
            &pending.proposal.token_ids,
            &pending.proposal.probs,
            target_probs,
        )?;
        let Some(pending) = self.pending.remove(&seq_id) else {
            return Err(Error::DraftUnavailable {
                seq_id,
                reason: "no pending proposal".into(),
            });
        };
        seq.take_pending_proposal();

        let before = seq.block_table().num_blocks();
        manager.truncate_slots(seq, pending.confirmed_slots + verification.num_accepted())?;
        let released_blocks = before - seq.block_table().num_blocks();

        self.stats.num_drafts += 1;
        self.stats.num_draft_tokens += pending.proposal.len() as u64;
        self.stats.num_accepted_tokens += verification.num_accepted() as u64;

        debug!(
            seq_id,
            drafted = pending.proposal.len(),
            accepted = verification.num_accepted(),
            released_blocks,
            "Verified draft"
        );
        Ok(Reconciliation {
            verification,
            released_blocks,
        })
    }

    /// Count tokens a verification actually committed to its sequence.
    ///
    /// A stop condition can cut the verified run short, so this is fed from
    /// the commit rather than from the verification itself.
    pub fn record_emitted(&mut self, num_tokens: usize) {
        self.stats.num_emitted_tokens += num_tokens as u64;
    }

    /// Drop the tentative extension of `seq` without verifying it.
    pub fn cancel(&mut self, manager: &mut BlockSpaceManager, seq: &mut Sequence) -> Result<()> {
        if let Some(pending) = self.pending.remove(&seq.seq_id()) {
            seq.take_pending_proposal();
            if !seq.block_table().is_empty() {
                manager.truncate_slots(seq, pending.confirmed_slots)?;
            }
        }
        Ok(())
    }

    /// Forget a sequence whose blocks were already freed.
    pub fn forget(&mut self, seq_id: SequenceId) {
        self.pending.remove(&seq_id);
    }
}
