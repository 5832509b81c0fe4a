//! Property-based tests for the block manager and the engine.
//!
//! Key invariants:
//! - Every GPU block is either free or referenced exactly once per holding sequence
//! - A shared block is only shared between sequences with identical tokens up to it
//! - Every block returns to its pool once all requests finish
//! - Every request completes with its full output under memory pressure

use std::collections::HashMap;

use paged_serve::core::block::BlockDevice;
use paged_serve::core::block_manager::{AllocationStatus, BlockSpaceManager};
use paged_serve::core::sequence::{SequenceGroup, SequenceId};
use paged_serve::engine::simulated::{CacheStore, HostSwapper, SimulatedExecutor};
use paged_serve::scheduler::PreemptionConfig;
use paged_serve::{
    CacheConfig, EngineConfig, GenerationRequest, LLMEngine, SamplingConfig, SchedulerConfig,
};
use proptest::prelude::*;

const BLOCK_SIZE: usize = 4;
const NUM_GPU_BLOCKS: usize = 32;

#[derive(Debug, Clone)]
enum Op {
    Admit { prompt: Vec<u32>, n: usize },
    Decode { idx: usize, token: u32 },
    Free { idx: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        // A two-letter alphabet makes shared prefixes common.
        (prop::collection::vec(0u32..2, 1..13), 1usize..4)
            .prop_map(|(prompt, n)| Op::Admit { prompt, n }),
        (any::<usize>(), 0u32..4).prop_map(|(idx, token)| Op::Decode { idx, token }),
        any::<usize>().prop_map(|idx| Op::Free { idx }),
    ]
}

fn seq_ids(group: &SequenceGroup) -> Vec<SequenceId> {
    group.sequences().iter().map(|s| s.seq_id()).collect()
}

/// Bring every sequence's computed count up to its length and seal.
fn compute_all(manager: &mut BlockSpaceManager, group: &mut SequenceGroup) {
    for seq_id in seq_ids(group) {
        let seq = group.get_seq_mut(seq_id).unwrap();
        seq.mark_computed(seq.total_len());
        manager.seal_completed_blocks(seq).unwrap();
    }
}

fn apply(manager: &mut BlockSpaceManager, groups: &mut Vec<SequenceGroup>, next_id: &mut u64, op: Op) {
    match op {
        Op::Admit { prompt, n } => {
            let sampling = SamplingConfig {
                n,
                ..Default::default()
            };
            let id = *next_id;
            *next_id += 1;
            let mut group = SequenceGroup::new(id, id * 10, prompt, sampling, BLOCK_SIZE);
            if manager.can_allocate(&group) == AllocationStatus::Ok {
                manager.allocate(&mut group).unwrap();
                compute_all(manager, &mut group);
                groups.push(group);
            }
        }
        Op::Decode { idx, token } => {
            if groups.is_empty() {
                return;
            }
            let len = groups.len();
            let group = &mut groups[idx % len];
            for seq_id in seq_ids(group) {
                let seq = group.get_seq_mut(seq_id).unwrap();
                let target = seq.total_len() + 1;
                if manager.blocks_to_append(seq, target) > manager.num_free_gpu_blocks() {
                    continue;
                }
                seq.append_token(token);
                manager.append_slots(seq, target).unwrap();
                seq.mark_computed(1);
                manager.seal_completed_blocks(seq).unwrap();
            }
        }
        Op::Free { idx } => {
            if groups.is_empty() {
                return;
            }
            let len = groups.len();
            let mut group = groups.swap_remove(idx % len);
            manager.free_group(&mut group).unwrap();
        }
    }
}

fn check_invariants(manager: &BlockSpaceManager, groups: &[SequenceGroup]) -> Result<(), TestCaseError> {
    prop_assert_eq!(
        manager.num_free_gpu_blocks() + manager.num_used_gpu_blocks(),
        NUM_GPU_BLOCKS
    );

    let mut holders: HashMap<usize, usize> = HashMap::new();
    for seq in groups.iter().flat_map(|g| g.sequences()) {
        for &block_id in seq.block_table().get_physical_block_ids() {
            *holders.entry(block_id).or_default() += 1;
        }
    }
    prop_assert_eq!(holders.len(), manager.num_used_gpu_blocks());
    for (&block_id, &count) in &holders {
        prop_assert_eq!(manager.ref_count(BlockDevice::Gpu, block_id), Some(count));
    }

    let seqs: Vec<_> = groups.iter().flat_map(|g| g.sequences()).collect();
    for (i, a) in seqs.iter().enumerate() {
        for b in &seqs[i + 1..] {
            let a_blocks = a.block_table().get_physical_block_ids();
            let b_blocks = b.block_table().get_physical_block_ids();
            for (idx, (x, y)) in a_blocks.iter().zip(b_blocks).enumerate() {
                if x != y {
                    continue;
                }
                let end = ((idx + 1) * BLOCK_SIZE).min(a.total_len()).min(b.total_len());
                prop_assert_eq!(
                    a.token_range(0, end),
                    b.token_range(0, end),
                    "sequences {} and {} share block {} with different tokens",
                    a.seq_id(),
                    b.seq_id(),
                    x
                );
            }
        }
    }
    Ok(())
}

fn engine_config(num_gpu_blocks: usize, num_cpu_blocks: usize, preemption: PreemptionConfig, chunked: bool) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            block_size: BLOCK_SIZE,
            num_gpu_blocks,
            num_cpu_blocks,
            enable_prefix_caching: true,
            watermark_blocks: 0,
        },
        scheduler: SchedulerConfig {
            max_model_len: 32,
            enable_chunked_prefill: chunked,
            chunk_size: 6,
            preemption,
            ..Default::default()
        },
        speculative: None,
    }
}

fn preemption() -> impl Strategy<Value = PreemptionConfig> {
    prop_oneof![
        Just(PreemptionConfig::Recompute),
        Just(PreemptionConfig::Swap),
        (1usize..16).prop_map(|recompute_threshold_tokens| PreemptionConfig::CostModel {
            recompute_threshold_tokens
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reference counts match the holders and sharing never mixes content.
    #[test]
    fn block_accounting_holds(ops in prop::collection::vec(op(), 1..60)) {
        let mut manager = BlockSpaceManager::new(BLOCK_SIZE, NUM_GPU_BLOCKS, 0, 0, true);
        let mut groups = Vec::new();
        let mut next_id = 1;

        for op in ops {
            apply(&mut manager, &mut groups, &mut next_id, op);
            check_invariants(&manager, &groups)?;
        }

        for mut group in groups.drain(..) {
            manager.free_group(&mut group).unwrap();
        }
        prop_assert_eq!(manager.num_free_gpu_blocks(), NUM_GPU_BLOCKS);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every request finishes with its full output and every block comes back.
    #[test]
    fn engine_completes_under_pressure(
        requests in prop::collection::vec(
            (prop::collection::vec(0u32..3, 1..16), 1usize..16, 1usize..3),
            1..8,
        ),
        num_gpu_blocks in 16usize..24,
        num_cpu_blocks in prop_oneof![Just(0usize), Just(8usize)],
        preemption in preemption(),
        chunked in any::<bool>(),
    ) {
        let config = engine_config(num_gpu_blocks, num_cpu_blocks, preemption, chunked);
        let store = CacheStore::shared(BLOCK_SIZE);
        let mut engine = LLMEngine::new(
            config,
            Box::new(SimulatedExecutor::new(16, 7, store.clone())),
            Box::new(HostSwapper::new(store)),
        )
        .unwrap();

        let mut expected = HashMap::new();
        for (prompt, max_tokens, n) in requests {
            let handle = engine
                .submit(GenerationRequest::new(prompt).max_tokens(max_tokens).n(n))
                .unwrap();
            for seq_id in handle.seq_ids {
                expected.insert(seq_id, max_tokens);
            }
        }

        let mut produced: HashMap<SequenceId, usize> = HashMap::new();
        let mut steps = 0;
        while engine.has_unfinished_requests() {
            for output in engine.step().unwrap() {
                *produced.entry(output.seq_id).or_default() += output.new_token_ids.len();
            }
            steps += 1;
            prop_assert!(steps < 5_000, "engine did not drain");
        }

        for (seq_id, max_tokens) in expected {
            prop_assert_eq!(produced.get(&seq_id).copied(), Some(max_tokens), "sequence {}", seq_id);
        }
        prop_assert_eq!(engine.num_free_gpu_blocks(), num_gpu_blocks);
        prop_assert_eq!(engine.num_free_cpu_blocks(), num_cpu_blocks);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Without priorities, no group is admitted ahead of an earlier one.
    #[test]
    fn admission_is_first_come_first_served(
        requests in prop::collection::vec((prop::collection::vec(0u32..3, 1..16), 1usize..8), 2..10),
        chunked in any::<bool>(),
    ) {
        let mut config = engine_config(64, 0, PreemptionConfig::Recompute, chunked);
        config.scheduler.max_num_seqs = 2;
        let store = CacheStore::shared(BLOCK_SIZE);
        let mut engine = LLMEngine::new(
            config,
            Box::new(SimulatedExecutor::new(16, 3, store.clone())),
            Box::new(HostSwapper::new(store)),
        )
        .unwrap();
        for (prompt, max_tokens) in requests {
            engine.submit(GenerationRequest::new(prompt).max_tokens(max_tokens)).unwrap();
        }

        let mut finished = Vec::new();
        while engine.has_unfinished_requests() {
            for output in engine.step().unwrap() {
                if output.is_finished() {
                    finished.push(output.group_id);
                }
            }

            let scheduler = engine.scheduler();
            let waiting = scheduler.waiting_group_ids();
            prop_assert!(waiting.windows(2).all(|w| w[0] < w[1]));
            if let Some(&first_waiting) = waiting.first() {
                for &group_id in scheduler.running_group_ids().iter().chain(&finished) {
                    prop_assert!(
                        group_id < first_waiting,
                        "group {} admitted ahead of waiting group {}",
                        group_id,
                        first_waiting
                    );
                }
            }
        }
    }
}
