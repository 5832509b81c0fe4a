//! Integration tests for the continuous batching scheduler.

use paged_serve::core::sequence::{FinishReason, GroupId, SequenceGroup, SequencePhase, SequenceStatus};
use paged_serve::engine::simulated::{CacheStore, HostSwapper};
use paged_serve::scheduler::{PreemptionConfig, PreemptionMode, Scheduler, SchedulerOutputs};
use paged_serve::{CacheConfig, SamplingConfig, SchedulerConfig};

const BLOCK_SIZE: usize = 4;

fn cache(num_gpu_blocks: usize, num_cpu_blocks: usize) -> CacheConfig {
    CacheConfig {
        block_size: BLOCK_SIZE,
        num_gpu_blocks,
        num_cpu_blocks,
        enable_prefix_caching: false,
        watermark_blocks: 0,
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_model_len: 64,
        ..Default::default()
    }
}

fn swapper() -> HostSwapper {
    HostSwapper::new(CacheStore::shared(BLOCK_SIZE))
}

fn group(id: GroupId, prompt_len: usize) -> SequenceGroup {
    group_with(id, prompt_len, SamplingConfig::default())
}

fn group_with(id: GroupId, prompt_len: usize, sampling: SamplingConfig) -> SequenceGroup {
    let prompt = (0..prompt_len as u32).map(|i| id as u32 * 100 + i).collect();
    SequenceGroup::new(id, id * 10, prompt, sampling, BLOCK_SIZE)
}

/// Apply a step's results: every processed token is now cached and every
/// sampling sequence gets `token`.
fn commit(sched: &mut Scheduler, out: &SchedulerOutputs, token: u32) {
    for s in &out.scheduled {
        let seq = sched
            .get_group_mut(s.group_id)
            .and_then(|g| g.get_seq_mut(s.seq_id))
            .unwrap();
        seq.mark_computed(s.token_ids.len());
        if s.samples {
            seq.append_token(token);
        }
    }
}

#[test]
fn test_fcfs_admission_order() {
    let mut sched = Scheduler::new(config(), &cache(16, 0), 0);
    for id in 1..=3 {
        sched.add_group(group(id, 5));
    }
    assert_eq!(sched.waiting_group_ids(), vec![1, 2, 3]);

    let out = sched.schedule(&mut swapper()).unwrap();
    let order: Vec<GroupId> = out.scheduled.iter().map(|s| s.group_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(sched.running_group_ids(), vec![1, 2, 3]);
    assert_eq!(out.num_prefill_tokens, 15);
    assert_eq!(out.num_decode_tokens, 0);
}

#[test]
fn test_priority_ignored_when_disabled() {
    let mut sched = Scheduler::new(config(), &cache(16, 0), 0);
    sched.add_group(group(1, 4));
    sched.add_group(group(2, 4).with_priority(10));
    assert_eq!(sched.waiting_group_ids(), vec![1, 2]);
}

#[test]
fn test_priority_orders_admission() {
    let config = SchedulerConfig {
        enable_priority: true,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(16, 0), 0);
    sched.add_group(group(1, 4));
    sched.add_group(group(2, 4).with_priority(3));
    sched.add_group(group(3, 4).with_priority(3));
    assert_eq!(sched.waiting_group_ids(), vec![2, 3, 1]);

    sched.schedule(&mut swapper()).unwrap();
    assert_eq!(sched.running_group_ids(), vec![2, 3, 1]);
}

#[test]
fn test_max_num_seqs_limits_batch() {
    let config = SchedulerConfig {
        max_num_seqs: 2,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(16, 0), 0);
    for id in 1..=3 {
        sched.add_group(group(id, 4));
    }

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.num_sequences(), 2);
    assert_eq!(sched.running_group_ids(), vec![1, 2]);
    assert_eq!(sched.waiting_group_ids(), vec![3]);
}

#[test]
fn test_token_budget_without_chunking() {
    let config = SchedulerConfig {
        enable_chunked_prefill: false,
        max_num_batched_tokens: 10,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(16, 0), 0);
    sched.add_group(group(1, 6));
    sched.add_group(group(2, 6));

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.num_prefill_tokens, 6);
    assert_eq!(sched.waiting_group_ids(), vec![2]);
    // Nothing was admitted, so no blocks were taken for it.
    assert_eq!(sched.block_manager().num_free_gpu_blocks(), 14);
}

#[test]
fn test_chunked_prefill_then_decode() {
    let config = SchedulerConfig {
        chunk_size: 4,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(8, 0), 0);
    sched.add_group(group(1, 10));

    let mut chunks = Vec::new();
    for _ in 0..3 {
        let out = sched.schedule(&mut swapper()).unwrap();
        let s = &out.scheduled[0];
        assert_eq!(s.phase, SequencePhase::Prefill);
        chunks.push((s.start_pos, s.token_ids.len(), s.samples));
        commit(&mut sched, &out, 77);
    }
    assert_eq!(chunks, vec![(0, 4, false), (4, 4, false), (8, 2, true)]);

    let out = sched.schedule(&mut swapper()).unwrap();
    let s = &out.scheduled[0];
    assert_eq!(s.phase, SequencePhase::Decode);
    assert_eq!(s.start_pos, 10);
    assert_eq!(s.token_ids, vec![77]);
    assert_eq!(out.num_decode_tokens, 1);
    // Position 10 is the third slot of the third block.
    assert_eq!(s.slot_mapping, vec![s.block_table[2] * BLOCK_SIZE + 2]);
}

#[test]
fn test_followers_wait_for_leader() {
    let sampling = SamplingConfig {
        n: 2,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config(), &cache(8, 0), 0);
    sched.add_group(group_with(1, 5, sampling));

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.num_sequences(), 1);
    assert_eq!(out.scheduled[0].seq_id, 10);
    assert_eq!(sched.block_manager().num_used_gpu_blocks(), 2);
}

#[test]
fn test_lookahead_slots_reserved_for_decode() {
    let mut sched = Scheduler::new(config(), &cache(8, 0), 3);
    sched.add_group(group(1, 4));
    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.scheduled[0].num_lookahead_slots, 0);
    commit(&mut sched, &out, 9);

    let out = sched.schedule(&mut swapper()).unwrap();
    let s = &out.scheduled[0];
    assert_eq!(s.num_lookahead_slots, 3);
    assert_eq!(s.slot_mapping.len(), 4);
    assert_eq!(out.num_decode_tokens, 4);
    assert_eq!(sched.get_sequence(10).unwrap().block_table().num_slots(), 8);
}

#[test]
fn test_lookahead_bounded_by_max_tokens() {
    let sampling = SamplingConfig {
        max_tokens: 2,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config(), &cache(8, 0), 3);
    sched.add_group(group_with(1, 4, sampling));
    let out = sched.schedule(&mut swapper()).unwrap();
    commit(&mut sched, &out, 9);

    // One token left to generate: no room for drafts.
    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.scheduled[0].num_lookahead_slots, 0);
}

/// Two 8-token prompts fill a 4-block pool; their first decode needs a block each.
fn saturated(preemption: PreemptionConfig, num_cpu_blocks: usize) -> Scheduler {
    let config = SchedulerConfig {
        preemption,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(4, num_cpu_blocks), 0);
    sched.add_group(group(1, 8));
    sched.add_group(group(2, 8));
    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.num_sequences(), 2);
    assert_eq!(sched.block_manager().num_free_gpu_blocks(), 0);
    commit(&mut sched, &out, 100);
    sched
}

#[test]
fn test_recompute_preemption_keeps_generated_tokens() {
    let mut sched = saturated(PreemptionConfig::Recompute, 0);

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.preempted, vec![(2, PreemptionMode::Recompute)]);
    assert_eq!(out.num_sequences(), 1);
    assert_eq!(out.scheduled[0].group_id, 1);
    assert_eq!(sched.waiting_group_ids(), vec![2]);

    let victim = sched.get_sequence(20).unwrap();
    assert_eq!(victim.status(), SequenceStatus::Waiting);
    assert_eq!(victim.num_computed_tokens(), 0);
    assert_eq!(victim.output_token_ids(), &[100]);
    assert!(victim.block_table().is_empty());

    // Once the first group is gone the victim prefills prompt and output.
    sched.abort_group(1).unwrap();
    sched.free_finished().unwrap();
    let out = sched.schedule(&mut swapper()).unwrap();
    let s = &out.scheduled[0];
    assert_eq!(s.group_id, 2);
    assert_eq!(s.phase, SequencePhase::Prefill);
    assert_eq!(s.token_ids.len(), 9);
    assert_eq!(s.token_ids.last(), Some(&100));
    assert!(s.samples);
}

#[test]
fn test_swap_preemption_round_trip() {
    let mut sched = saturated(PreemptionConfig::Swap, 8);
    let mut swapper = swapper();

    let out = sched.schedule(&mut swapper).unwrap();
    assert_eq!(out.preempted, vec![(2, PreemptionMode::Swap)]);
    assert_eq!(out.blocks_to_swap_out.len(), 2);
    assert_eq!(sched.swapped_group_ids(), vec![2]);
    assert_eq!(sched.group_status(2), Some(SequenceStatus::Swapped));
    assert_eq!(sched.block_manager().num_used_cpu_blocks(), 2);

    sched.abort_group(1).unwrap();
    sched.free_finished().unwrap();

    let out = sched.schedule(&mut swapper).unwrap();
    assert_eq!(out.blocks_to_swap_in.len(), 2);
    assert_eq!(sched.group_status(2), Some(SequenceStatus::Running));
    assert_eq!(sched.block_manager().num_used_cpu_blocks(), 0);

    // Swapping keeps the cache, so the group resumes decoding.
    let s = &out.scheduled[0];
    assert_eq!(s.phase, SequencePhase::Decode);
    assert_eq!(s.start_pos, 8);
    assert_eq!(s.token_ids, vec![100]);
    assert_eq!(swapper.num_copies(), 4);
}

#[test]
fn test_failed_swap_out_falls_back_to_recompute() {
    let mut sched = saturated(PreemptionConfig::Swap, 8);
    let mut swapper = swapper();
    swapper.fail_next(1);

    let out = sched.schedule(&mut swapper).unwrap();
    assert_eq!(out.preempted, vec![(2, PreemptionMode::Recompute)]);
    assert!(out.blocks_to_swap_out.is_empty());
    assert!(sched.swapped_group_ids().is_empty());
    assert_eq!(sched.waiting_group_ids(), vec![2]);
    assert_eq!(sched.block_manager().num_free_cpu_blocks(), 8);
}

#[test]
fn test_failed_swap_in_falls_back_to_recompute() {
    let mut sched = saturated(PreemptionConfig::Swap, 8);
    let mut swapper = swapper();
    sched.schedule(&mut swapper).unwrap();
    sched.abort_group(1).unwrap();
    sched.free_finished().unwrap();

    swapper.fail_next(1);
    let out = sched.schedule(&mut swapper).unwrap();
    assert!(out.was_preempted(2));
    assert!(out.blocks_to_swap_in.is_empty());
    assert_eq!(sched.block_manager().num_free_cpu_blocks(), 8);

    // Nothing is swapped anymore, so the group is readmitted in the same step.
    assert_eq!(sched.group_status(2), Some(SequenceStatus::Running));
    assert_eq!(out.scheduled[0].token_ids.len(), 9);
}

#[test]
fn test_third_group_takes_the_remaining_blocks() {
    let mut sched = Scheduler::new(config(), &cache(8, 0), 0);
    let mut swapper = swapper();
    sched.add_group(group(1, 6));
    sched.add_group(group(2, 6));
    let out = sched.schedule(&mut swapper).unwrap();
    assert_eq!(sched.running_group_ids(), vec![1, 2]);
    assert_eq!(sched.block_manager().num_used_gpu_blocks(), 4);
    commit(&mut sched, &out, 7);

    // 16 tokens need exactly the 4 free blocks.
    sched.add_group(group(3, 16));
    let out = sched.schedule(&mut swapper).unwrap();
    assert_eq!(sched.running_group_ids(), vec![1, 2, 3]);
    assert_eq!(sched.block_manager().num_used_gpu_blocks(), 8);
    commit(&mut sched, &out, 7);

    // Its first decode token needs a fifth block: something has to give way.
    for _ in 0..6 {
        let out = sched.schedule(&mut swapper).unwrap();
        assert!(out.ignored.is_empty());
        assert!(sched.block_manager().num_used_gpu_blocks() <= 8);
        assert!(matches!(
            sched.group_status(3),
            Some(SequenceStatus::Running | SequenceStatus::Waiting)
        ));
        commit(&mut sched, &out, 7);
    }
    assert_eq!(sched.group_status(1), Some(SequenceStatus::Running));
}

#[test]
fn test_prompt_larger_than_pool_is_ignored() {
    let mut sched = Scheduler::new(config(), &cache(4, 0), 0);
    sched.add_group(group(1, 17));
    sched.add_group(group(2, 4));

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.ignored, vec![1]);
    assert_eq!(
        sched.get_sequence(10).unwrap().finish_reason(),
        Some(FinishReason::CapacityExceeded)
    );
    // The group behind it is not blocked.
    assert_eq!(out.scheduled[0].group_id, 2);

    let removed = sched.free_finished().unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].group_id(), 1);
}

#[test]
fn test_lone_group_outgrowing_pool_is_ignored() {
    let mut sched = Scheduler::new(config(), &cache(2, 0), 0);
    sched.add_group(group(1, 8));
    let out = sched.schedule(&mut swapper()).unwrap();
    commit(&mut sched, &out, 5);

    let out = sched.schedule(&mut swapper()).unwrap();
    assert_eq!(out.ignored, vec![1]);
    assert!(out.is_empty());
    assert_eq!(sched.block_manager().num_free_gpu_blocks(), 2);
    assert!(!sched.has_unfinished_groups());
}

#[test]
fn test_priority_preempts_lower_priority_running_group() {
    let config = SchedulerConfig {
        enable_priority: true,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(4, 8), 0);
    sched.add_group(group(1, 16));
    sched.schedule(&mut swapper()).unwrap();
    assert_eq!(sched.block_manager().num_free_gpu_blocks(), 0);

    sched.add_group(group(2, 4).with_priority(5));
    let out = sched.schedule(&mut swapper()).unwrap();

    assert_eq!(out.preempted, vec![(1, PreemptionMode::Recompute)]);
    assert_eq!(out.scheduled[0].group_id, 2);
    assert_eq!(sched.running_group_ids(), vec![2]);
    assert_eq!(sched.waiting_group_ids(), vec![1]);
}

#[test]
fn test_equal_priority_does_not_preempt() {
    let config = SchedulerConfig {
        enable_priority: true,
        ..config()
    };
    let mut sched = Scheduler::new(config, &cache(4, 0), 0);
    sched.add_group(group(1, 16));
    sched.schedule(&mut swapper()).unwrap();

    sched.add_group(group(2, 4));
    let out = sched.schedule(&mut swapper()).unwrap();
    assert!(out.preempted.is_empty());
    assert_eq!(sched.waiting_group_ids(), vec![2]);
}
