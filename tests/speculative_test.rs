//! Integration tests for draft proposal, verification and slot reconciliation.

use paged_serve::core::block_manager::BlockSpaceManager;
use paged_serve::core::sequence::{SequenceGroup, SequenceId};
use paged_serve::{
    DraftProposal, DraftProposer, Error, Result, SamplingConfig, SpeculativeConfig,
    SpeculativeCoordinator,
};

const VOCAB: usize = 8;

fn one_hot(idx: u32) -> Vec<f32> {
    let mut v = vec![0.0; VOCAB];
    v[idx as usize] = 1.0;
    v
}

/// Proposes a fixed script with one-hot draft distributions.
struct ScriptedDraft {
    tokens: Vec<u32>,
    available: bool,
}

impl DraftProposer for ScriptedDraft {
    fn propose(&mut self, seq_id: SequenceId, _context: &[u32], k: usize) -> Result<DraftProposal> {
        if !self.available {
            return Err(Error::DraftUnavailable {
                seq_id,
                reason: "offline".into(),
            });
        }
        let token_ids: Vec<u32> = self.tokens.iter().copied().take(k).collect();
        let probs = token_ids.iter().map(|&t| one_hot(t)).collect();
        Ok(DraftProposal { token_ids, probs })
    }
}

fn draft(tokens: &[u32]) -> ScriptedDraft {
    ScriptedDraft {
        tokens: tokens.to_vec(),
        available: true,
    }
}

fn coordinator() -> SpeculativeCoordinator {
    SpeculativeCoordinator::new(SpeculativeConfig::new().num_tokens(4).seed(5))
}

/// A decoding sequence with 4 tokens and 4 lookahead slots reserved, one
/// token per block.
fn decoding_group(manager: &mut BlockSpaceManager) -> SequenceGroup {
    let mut group = SequenceGroup::new(1, 1, vec![5, 6, 7], SamplingConfig::default(), 1);
    manager.allocate(&mut group).unwrap();
    let seq = group.get_seq_mut(1).unwrap();
    seq.mark_computed(3);
    seq.append_token(0);
    manager.append_slots(seq, 4 + 4).unwrap();
    assert_eq!(manager.num_used_gpu_blocks(), 8);
    group
}

#[test]
fn test_rejection_releases_tentative_slots() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    let proposed = coordinator
        .propose(&mut draft(&[1, 2, 3, 4]), &mut manager, seq, 4)
        .unwrap();
    assert_eq!(proposed, vec![1, 2, 3, 4]);
    assert_eq!(seq.pending_proposal(), &[1, 2, 3, 4]);
    assert!(coordinator.has_pending(1));

    // The target agrees with the first two drafts and wants 6 instead of 3.
    let target = vec![one_hot(1), one_hot(2), one_hot(6), one_hot(4), one_hot(5)];
    let reconciliation = coordinator
        .verify_and_reconcile(&mut manager, seq, &target)
        .unwrap();

    assert_eq!(reconciliation.verification.accepted, vec![1, 2]);
    assert_eq!(reconciliation.verification.final_token, 6);
    assert_eq!(reconciliation.released_blocks, 2);
    assert_eq!(seq.block_table().num_blocks(), 6);
    assert_eq!(manager.num_used_gpu_blocks(), 6);
    assert!(seq.pending_proposal().is_empty());
    assert!(!coordinator.has_pending(1));

    let stats = coordinator.stats();
    assert_eq!(stats.num_drafts, 1);
    assert_eq!(stats.num_draft_tokens, 4);
    assert_eq!(stats.num_accepted_tokens, 2);
    assert!((stats.acceptance_rate() - 0.5).abs() < 1e-9);

    // Emitted tokens are counted once the caller commits them.
    assert_eq!(stats.num_emitted_tokens, 0);
    coordinator.record_emitted(2);
    assert_eq!(coordinator.stats().num_emitted_tokens, 2);
}

#[test]
fn test_malformed_target_keeps_proposal_for_cancel() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    coordinator
        .propose(&mut draft(&[1, 2, 3, 4]), &mut manager, seq, 4)
        .unwrap();
    let short_target = vec![one_hot(1), one_hot(2)];
    assert!(coordinator
        .verify_and_reconcile(&mut manager, seq, &short_target)
        .is_err());
    assert!(coordinator.has_pending(1));
    assert_eq!(coordinator.stats().num_drafts, 0);

    coordinator.cancel(&mut manager, seq).unwrap();
    assert!(!coordinator.has_pending(1));
    assert!(seq.pending_proposal().is_empty());
    assert_eq!(manager.num_used_gpu_blocks(), 4);
}

#[test]
fn test_full_acceptance_keeps_every_slot() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    coordinator
        .propose(&mut draft(&[1, 2, 3, 4]), &mut manager, seq, 4)
        .unwrap();
    let target = vec![one_hot(1), one_hot(2), one_hot(3), one_hot(4), one_hot(7)];
    let reconciliation = coordinator
        .verify_and_reconcile(&mut manager, seq, &target)
        .unwrap();

    assert_eq!(reconciliation.verification.emitted(), vec![1, 2, 3, 4, 7]);
    assert_eq!(reconciliation.released_blocks, 0);
    assert_eq!(manager.num_used_gpu_blocks(), 8);
}

#[test]
fn test_short_proposal_releases_unused_slots() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    let proposed = coordinator
        .propose(&mut draft(&[1, 2]), &mut manager, seq, 4)
        .unwrap();
    assert_eq!(proposed.len(), 2);
    assert_eq!(manager.num_used_gpu_blocks(), 6);
}

#[test]
fn test_unavailable_draft_falls_back() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    let mut offline = ScriptedDraft {
        tokens: vec![1, 2, 3, 4],
        available: false,
    };
    let proposed = coordinator.propose(&mut offline, &mut manager, seq, 4).unwrap();

    assert!(proposed.is_empty());
    assert!(!coordinator.has_pending(1));
    assert_eq!(coordinator.stats().num_fallbacks, 1);
    // Only the confirmed tokens keep their slots.
    assert_eq!(seq.block_table().num_slots(), 4);
    assert_eq!(manager.num_used_gpu_blocks(), 4);
}

#[test]
fn test_cancel_drops_tentative_extension() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    coordinator
        .propose(&mut draft(&[1, 2, 3]), &mut manager, seq, 4)
        .unwrap();
    coordinator.cancel(&mut manager, seq).unwrap();

    assert!(!coordinator.has_pending(1));
    assert!(seq.pending_proposal().is_empty());
    assert_eq!(manager.num_used_gpu_blocks(), 4);
    assert_eq!(coordinator.stats().num_drafts, 0);
}

#[test]
fn test_verify_without_proposal_fails() {
    let mut manager = BlockSpaceManager::new(1, 32, 0, 0, false);
    let mut group = decoding_group(&mut manager);
    let seq = group.get_seq_mut(1).unwrap();
    let mut coordinator = coordinator();

    let err = coordinator
        .verify_and_reconcile(&mut manager, seq, &[one_hot(0)])
        .unwrap_err();
    assert!(matches!(err, Error::DraftUnavailable { seq_id: 1, .. }));
}
