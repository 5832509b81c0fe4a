//! Continuous batching scheduler.
//!
//! The scheduler decides, every step, which sequence groups advance and by
//! how many tokens, and keeps the GPU pool within capacity by preempting.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add_group()                                       schedule()
//!        │                                                │
//!        ▼            admit (FCFS / priority)             ▼
//!   ┌─────────┐ ─────────────────────────────────► ┌───────────┐
//!   │ WAITING │                                    │  RUNNING  │
//!   └─────────┘ ◄───────── preempt (recompute) ─── └───────────┘
//!                                                    │      ▲
//!                                   preempt (swap)   ▼      │  swap in
//!                                                  ┌───────────┐
//!                                                  │  SWAPPED  │
//!                                                  └───────────┘
//! ```
//!
//! One step runs three phases in order:
//!
//! 1. **Running**: grow every running group by its token count (a prefill
//!    chunk, one decode token, or one token plus lookahead slots). A group that
//!    cannot get its blocks preempts victims chosen by the
//!    [`PreemptionPolicy`] until it can, or is preempted itself.
//! 2. **Swapped**: if nothing was preempted, bring swapped groups back,
//!    oldest first.
//! 3. **Waiting**: if nothing is swapped and nothing was preempted, admit
//!    waiting groups in order. Admission stops at the first group that does
//!    not fit, so a later arrival never overtakes an earlier one.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::iter;

use tracing::{debug, instrument, trace, warn};

use crate::config::{CacheConfig, SchedulerConfig};
use crate::core::block::BlockId;
use crate::core::block_manager::{AllocationStatus, BlockMapping, BlockSpaceManager};
use crate::core::sequence::{
    FinishReason, GroupId, Priority, Sequence, SequenceGroup, SequenceId, SequencePhase,
    SequenceStatus, DEFAULT_PRIORITY,
};
use crate::engine::executor::BlockSwapper;
use crate::error::{Error, Result};
use crate::scheduler::budget::SchedulingBudget;
use crate::scheduler::policy::{PreemptionMode, PreemptionPolicy, VictimCandidate};

/// One sequence's share of a step.
#[derive(Debug, Clone)]
pub struct ScheduledSequence {
    pub group_id: GroupId,
    pub seq_id: SequenceId,
    pub phase: SequencePhase,
    /// Position of the first token in `token_ids`.
    pub start_pos: usize,
    /// Tokens whose KV entries this step writes.
    pub token_ids: Vec<u32>,
    /// Slots reserved past `token_ids` for draft tokens.
    pub num_lookahead_slots: usize,
    /// Draft tokens placed in the lookahead slots for verification.
    pub draft_token_ids: Vec<u32>,
    /// The step reaches the newest token, so it yields a sampled token.
    pub samples: bool,
    /// Snapshot of the physical blocks, in logical order.
    pub block_table: Vec<BlockId>,
    /// Global slot of every processed position, lookahead included.
    pub slot_mapping: Vec<usize>,
}

impl ScheduledSequence {
    /// Tokens charged to the budget.
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len() + self.num_lookahead_slots
    }
}

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Sequences to process this step, prefills and decodes mixed.
    pub scheduled: Vec<ScheduledSequence>,
    /// Copy-on-write copies to apply before the forward pass.
    pub blocks_to_copy: BlockMapping,
    /// GPU → CPU copies performed while scheduling.
    pub blocks_to_swap_out: BlockMapping,
    /// CPU → GPU copies performed while scheduling.
    pub blocks_to_swap_in: BlockMapping,
    /// Groups preempted this step and how.
    pub preempted: Vec<(GroupId, PreemptionMode)>,
    /// Groups that can never fit and were finished with `CapacityExceeded`.
    pub ignored: Vec<GroupId>,
    /// Total number of prefill tokens this iteration.
    pub num_prefill_tokens: usize,
    /// Total number of decode tokens this iteration (lookahead included).
    pub num_decode_tokens: usize,
}

impl SchedulerOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any sequences to process.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    pub fn num_sequences(&self) -> usize {
        self.scheduled.len()
    }

    pub fn prefill_sequences(&self) -> impl Iterator<Item = &ScheduledSequence> {
        self.scheduled
            .iter()
            .filter(|s| s.phase == SequencePhase::Prefill)
    }

    pub fn decode_sequences(&self) -> impl Iterator<Item = &ScheduledSequence> {
        self.scheduled
            .iter()
            .filter(|s| s.phase == SequencePhase::Decode)
    }

    pub fn get(&self, seq_id: SequenceId) -> Option<&ScheduledSequence> {
        self.scheduled.iter().find(|s| s.seq_id == seq_id)
    }

    pub fn was_preempted(&self, group_id: GroupId) -> bool {
        self.preempted.iter().any(|&(id, _)| id == group_id)
    }
}

/// Entry in the waiting queue.
///
/// Ordered by (priority DESC, arrival_order ASC).
#[derive(Debug, Clone)]
struct PriorityEntry {
    group_id: GroupId,
    priority: Priority,
    arrival_order: u64,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.group_id == other.group_id
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier arrival (lower order)
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.arrival_order.cmp(&self.arrival_order),
            ord => ord,
        }
    }
}

/// Planned work of one sequence within a step.
#[derive(Debug, Clone, Copy)]
struct SeqWork {
    seq_id: SequenceId,
    phase: SequencePhase,
    /// Input tokens processed.
    num_input_tokens: usize,
    num_lookahead_slots: usize,
    /// Token slots the table must hold afterwards.
    target_slots: usize,
}

impl SeqWork {
    fn num_tokens(&self) -> usize {
        self.num_input_tokens + self.num_lookahead_slots
    }
}

/// Continuous batching scheduler.
///
/// Owns every live [`SequenceGroup`] and the [`BlockSpaceManager`]. Groups
/// move between three queues:
/// - Waiting: not holding any blocks
/// - Running: GPU blocks allocated
/// - Swapped: blocks parked in the host pool
pub struct Scheduler {
    config: SchedulerConfig,
    block_manager: BlockSpaceManager,
    policy: Box<dyn PreemptionPolicy>,
    /// All live groups.
    groups: HashMap<GroupId, SequenceGroup>,
    /// Sequence → owning group.
    seq_to_group: HashMap<SequenceId, GroupId>,
    waiting: BinaryHeap<PriorityEntry>,
    /// Running groups in admission order.
    running: VecDeque<GroupId>,
    /// Swapped groups, oldest swap first.
    swapped: VecDeque<GroupId>,
    /// Counter for arrival ordering.
    arrival_counter: u64,
    /// Draft slots reserved per decoding sequence.
    num_lookahead_slots: usize,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler limits and preemption policy
    /// * `cache` - Pool sizes for the block manager
    /// * `num_lookahead_slots` - Draft tokens per decode step (0 without speculation)
    pub fn new(config: SchedulerConfig, cache: &CacheConfig, num_lookahead_slots: usize) -> Self {
        let policy = config.preemption.build();
        Self::with_policy(config, cache, num_lookahead_slots, policy)
    }

    /// Create a scheduler with a custom preemption policy.
    pub fn with_policy(
        config: SchedulerConfig,
        cache: &CacheConfig,
        num_lookahead_slots: usize,
        policy: Box<dyn PreemptionPolicy>,
    ) -> Self {
        Self {
            config,
            block_manager: BlockSpaceManager::from_config(cache),
            policy,
            groups: HashMap::new(),
            seq_to_group: HashMap::new(),
            waiting: BinaryHeap::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            arrival_counter: 0,
            num_lookahead_slots,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_lookahead_slots(&self) -> usize {
        self.num_lookahead_slots
    }

    /// Add a new group to the waiting queue.
    pub fn add_group(&mut self, mut group: SequenceGroup) {
        let group_id = group.group_id();
        group.set_arrival_order(self.arrival_counter);
        self.arrival_counter += 1;

        for seq in group.sequences() {
            self.seq_to_group.insert(seq.seq_id(), group_id);
        }
        self.waiting.push(PriorityEntry {
            group_id,
            priority: self.effective_priority(&group),
            arrival_order: group.arrival_order(),
        });
        trace!(group_id, "Queued group");
        self.groups.insert(group_id, group);
    }

    fn effective_priority(&self, group: &SequenceGroup) -> Priority {
        if self.config.enable_priority {
            group.priority()
        } else {
            DEFAULT_PRIORITY
        }
    }

    // ========== Scheduling ==========

    /// Schedule the next iteration.
    ///
    /// Swap copies run synchronously through `swapper`; a swapped group only
    /// becomes running once its copy is confirmed.
    #[instrument(skip_all)]
    pub fn schedule(&mut self, swapper: &mut dyn BlockSwapper) -> Result<SchedulerOutputs> {
        let mut budget = SchedulingBudget::new(
            self.config.max_num_batched_tokens,
            self.config.max_num_seqs,
        );
        let mut outputs = SchedulerOutputs::new();

        if self.config.enable_priority && self.swapped.is_empty() {
            self.preempt_for_priority(&mut outputs)?;
        }

        let preempted = self.schedule_running(&mut budget, &mut outputs, swapper)?;
        if !preempted {
            self.schedule_swapped(&mut budget, &mut outputs, swapper)?;
        }
        if !preempted && self.swapped.is_empty() {
            self.schedule_waiting(&mut budget, &mut outputs)?;
        }

        trace!(
            scheduled = outputs.scheduled.len(),
            prefill_tokens = outputs.num_prefill_tokens,
            decode_tokens = outputs.num_decode_tokens,
            free_gpu_blocks = self.block_manager.num_free_gpu_blocks(),
            waiting = self.waiting.len(),
            running = self.running.len(),
            swapped = self.swapped.len(),
            "Scheduled step"
        );
        Ok(outputs)
    }

    /// Grow running groups, preempting under memory pressure.
    ///
    /// Returns whether anything was preempted.
    #[instrument(skip_all)]
    fn schedule_running(
        &mut self,
        budget: &mut SchedulingBudget,
        outputs: &mut SchedulerOutputs,
        swapper: &mut dyn BlockSwapper,
    ) -> Result<bool> {
        let ranks: HashMap<GroupId, usize> = self
            .running
            .iter()
            .enumerate()
            .map(|(rank, &id)| (id, rank))
            .collect();
        let mut queue: VecDeque<GroupId> = std::mem::take(&mut self.running);
        if self.config.enable_priority {
            let groups = &self.groups;
            queue
                .make_contiguous()
                .sort_by_key(|id| std::cmp::Reverse(groups.get(id).map_or(DEFAULT_PRIORITY, SequenceGroup::priority)));
        }

        let mut preempted_any = false;
        let mut budget_exhausted = false;
        while let Some(group_id) = queue.pop_front() {
            let Some(group) = self.groups.get(&group_id) else {
                continue;
            };
            if budget_exhausted {
                self.running.push_back(group_id);
                continue;
            }

            let work = self.plan_group(group, budget.remaining_token_budget());
            let num_tokens: usize = work.iter().map(SeqWork::num_tokens).sum();
            if work.is_empty() {
                self.running.push_back(group_id);
                continue;
            }
            if !budget.can_schedule(num_tokens, work.len()) {
                budget_exhausted = true;
                self.running.push_back(group_id);
                continue;
            }

            let mut schedulable = true;
            loop {
                let group = self.groups.get(&group_id).ok_or(Error::GroupNotFound(group_id))?;
                if self.blocks_needed(group, &work) <= self.block_manager.num_free_gpu_blocks() {
                    break;
                }

                if queue.is_empty() && self.running.is_empty() {
                    // Alone on the GPU and still cannot grow.
                    let required = BlockSpaceManager::num_group_blocks(group) + self.blocks_needed(group, &work);
                    self.ignore_group(group_id, required, outputs)?;
                    schedulable = false;
                    break;
                }

                let candidates: Vec<VictimCandidate> = queue
                    .iter()
                    .chain(iter::once(&group_id))
                    .filter_map(|id| self.victim_candidate(*id, ranks.get(id).copied().unwrap_or(0)))
                    .collect();
                let Some(victim) = self
                    .policy
                    .select_victim(&candidates)
                    .and_then(|idx| candidates.get(idx).cloned())
                else {
                    schedulable = false;
                    self.running.push_back(group_id);
                    break;
                };

                queue.retain(|&id| id != victim.group_id);
                self.preempt(&victim, outputs, swapper)?;
                preempted_any = true;
                if victim.group_id == group_id {
                    schedulable = false;
                    break;
                }
            }

            if schedulable {
                self.running.push_back(group_id);
                self.emit_group(group_id, &work, budget, outputs)?;
            }
        }

        Ok(preempted_any)
    }

    /// Bring swapped groups back to the GPU, oldest first.
    #[instrument(skip_all)]
    fn schedule_swapped(
        &mut self,
        budget: &mut SchedulingBudget,
        outputs: &mut SchedulerOutputs,
        swapper: &mut dyn BlockSwapper,
    ) -> Result<()> {
        while let Some(&group_id) = self.swapped.front() {
            let group = self.groups.get(&group_id).ok_or(Error::GroupNotFound(group_id))?;
            match self.block_manager.can_swap_in(group) {
                AllocationStatus::Ok => {}
                AllocationStatus::Later => break,
                AllocationStatus::Never => {
                    let required = BlockSpaceManager::num_group_blocks(group);
                    self.swapped.pop_front();
                    self.ignore_group(group_id, required, outputs)?;
                    continue;
                }
            }

            let work = self.plan_group(group, budget.remaining_token_budget());
            let num_tokens: usize = work.iter().map(SeqWork::num_tokens).sum();
            if work.is_empty() || !budget.can_schedule(num_tokens, work.len()) {
                break;
            }
            self.swapped.pop_front();

            let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;
            match self.block_manager.swap_in(group, swapper) {
                Ok(mapping) => {
                    for seq in group.unfinished_seqs_mut() {
                        seq.set_running()?;
                    }
                    outputs.blocks_to_swap_in.extend(mapping);
                }
                Err(Error::SwapFailure(reason)) => {
                    warn!(group_id, %reason, "Swap-in failed, preempting by recompute");
                    Self::reset_for_recompute(&mut self.block_manager, group)?;
                    let entry = PriorityEntry {
                        group_id,
                        priority: if self.config.enable_priority { group.priority() } else { DEFAULT_PRIORITY },
                        arrival_order: group.arrival_order(),
                    };
                    self.waiting.push(entry);
                    outputs.preempted.push((group_id, PreemptionMode::Recompute));
                    continue;
                }
                Err(err) => {
                    self.swapped.push_front(group_id);
                    return Err(err);
                }
            }

            self.running.push_back(group_id);
            let group = self.groups.get(&group_id).ok_or(Error::GroupNotFound(group_id))?;
            let work = self.plan_group(group, budget.remaining_token_budget());
            if self.blocks_needed(group, &work) <= self.block_manager.num_free_gpu_blocks() {
                self.emit_group(group_id, &work, budget, outputs)?;
            }
        }
        Ok(())
    }

    /// Admit waiting groups in queue order.
    #[instrument(skip_all)]
    fn schedule_waiting(&mut self, budget: &mut SchedulingBudget, outputs: &mut SchedulerOutputs) -> Result<()> {
        while let Some(entry) = self.waiting.peek().cloned() {
            let group_id = entry.group_id;
            let Some(group) = self.groups.get(&group_id) else {
                self.waiting.pop();
                continue;
            };

            match self.block_manager.can_allocate(group) {
                AllocationStatus::Ok => {}
                AllocationStatus::Later => break,
                AllocationStatus::Never => {
                    let required = self.block_manager.blocks_for_admission(group);
                    self.waiting.pop();
                    self.ignore_group(group_id, required, outputs)?;
                    continue;
                }
            }

            let num_seqs = group.num_unfinished_seqs();
            let num_tokens = if self.config.enable_chunked_prefill {
                1
            } else {
                self.prefill_tokens_estimate(group)
            };
            if !budget.can_schedule(num_tokens, num_seqs) {
                break;
            }

            self.waiting.pop();
            let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;
            self.block_manager.allocate(group)?;
            for seq in group.unfinished_seqs_mut() {
                seq.set_running()?;
            }
            debug!(
                group_id,
                prompt_len = group.prompt_len(),
                free_gpu_blocks = self.block_manager.num_free_gpu_blocks(),
                "Admitted group"
            );
            self.running.push_back(group_id);

            let group = self.groups.get(&group_id).ok_or(Error::GroupNotFound(group_id))?;
            let work = self.plan_group(group, budget.remaining_token_budget());
            if self.blocks_needed(group, &work) <= self.block_manager.num_free_gpu_blocks() {
                self.emit_group(group_id, &work, budget, outputs)?;
            }
        }
        Ok(())
    }

    /// Evict lower-priority running groups so the head of the waiting queue
    /// can be admitted. Victims are always recomputed.
    #[instrument(skip_all)]
    fn preempt_for_priority(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        loop {
            let Some(head) = self.waiting.peek().cloned() else {
                return Ok(());
            };
            let Some(group) = self.groups.get(&head.group_id) else {
                return Ok(());
            };
            if self.block_manager.can_allocate(group) != AllocationStatus::Later {
                return Ok(());
            }

            let candidates: Vec<VictimCandidate> = self
                .running
                .iter()
                .enumerate()
                .filter_map(|(rank, &id)| self.victim_candidate(id, rank))
                .filter(|c| c.priority < head.priority)
                .collect();
            let Some(victim) = self
                .policy
                .select_victim(&candidates)
                .and_then(|idx| candidates.get(idx))
            else {
                return Ok(());
            };

            let victim_id = victim.group_id;
            warn!(group_id = victim_id, for_group = head.group_id, "Preempting for higher priority");
            self.running.retain(|&id| id != victim_id);
            let group = self.groups.get_mut(&victim_id).ok_or(Error::GroupNotFound(victim_id))?;
            Self::reset_for_recompute(&mut self.block_manager, group)?;
            let entry = PriorityEntry {
                group_id: victim_id,
                priority: group.priority(),
                arrival_order: group.arrival_order(),
            };
            self.waiting.push(entry);
            outputs.preempted.push((victim_id, PreemptionMode::Recompute));
        }
    }

    // ========== Planning ==========

    /// Draft slots for a decoding sequence, bounded by how many more tokens
    /// it may still emit.
    fn lookahead_for(&self, group: &SequenceGroup, seq: &Sequence) -> usize {
        if self.num_lookahead_slots == 0 {
            return 0;
        }
        let by_tokens = group.sampling().max_tokens.saturating_sub(seq.output_len());
        let by_length = self.config.max_model_len.saturating_sub(seq.total_len());
        self.num_lookahead_slots
            .min(by_tokens.min(by_length).saturating_sub(1))
    }

    fn plan_group(&self, group: &SequenceGroup, remaining_tokens: usize) -> Vec<SeqWork> {
        let mut remaining = remaining_tokens;
        let mut work = Vec::new();

        for seq in group.unfinished_seqs() {
            if group.is_waiting_on_leader(seq) {
                continue;
            }
            let planned = match seq.phase() {
                SequencePhase::Prefill => {
                    let mut num_tokens = seq.num_uncomputed_tokens();
                    if self.config.enable_chunked_prefill {
                        num_tokens = num_tokens.min(self.config.chunk_size).min(remaining);
                    }
                    if num_tokens == 0 {
                        continue;
                    }
                    SeqWork {
                        seq_id: seq.seq_id(),
                        phase: SequencePhase::Prefill,
                        num_input_tokens: num_tokens,
                        num_lookahead_slots: 0,
                        target_slots: seq.num_computed_tokens() + num_tokens,
                    }
                }
                SequencePhase::Decode => {
                    let lookahead = self.lookahead_for(group, seq);
                    SeqWork {
                        seq_id: seq.seq_id(),
                        phase: SequencePhase::Decode,
                        num_input_tokens: 1,
                        num_lookahead_slots: lookahead,
                        target_slots: seq.total_len() + lookahead,
                    }
                }
            };
            remaining = remaining.saturating_sub(planned.num_tokens());
            work.push(planned);
        }
        work
    }

    /// GPU blocks the planned work needs. Prefill slots are allocated at
    /// admission, so only decodes grow.
    fn blocks_needed(&self, group: &SequenceGroup, work: &[SeqWork]) -> usize {
        work.iter()
            .filter(|w| w.phase == SequencePhase::Decode)
            .filter_map(|w| group.get_seq(w.seq_id).map(|seq| (seq, w.target_slots)))
            .map(|(seq, slots)| self.block_manager.blocks_to_append(seq, slots))
            .sum()
    }

    fn prefill_tokens_estimate(&self, group: &SequenceGroup) -> usize {
        if group.is_fresh() {
            group.leader().map_or(0, Sequence::num_uncomputed_tokens)
        } else {
            group.unfinished_seqs().map(Sequence::num_uncomputed_tokens).sum()
        }
    }

    /// Reserve slots for planned work and record it in the outputs.
    fn emit_group(
        &mut self,
        group_id: GroupId,
        work: &[SeqWork],
        budget: &mut SchedulingBudget,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }
        let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;

        let mut num_tokens = 0;
        for w in work {
            let seq = group.get_seq_mut(w.seq_id).ok_or(Error::SequenceNotFound(w.seq_id))?;
            if w.phase == SequencePhase::Decode {
                let copies = self.block_manager.append_slots(seq, w.target_slots)?;
                outputs.blocks_to_copy.extend(copies);
                outputs.num_decode_tokens += w.num_tokens();
            } else {
                outputs.num_prefill_tokens += w.num_tokens();
            }

            let start_pos = seq.num_computed_tokens();
            let end_pos = start_pos + w.num_input_tokens;
            let table = seq.block_table();
            outputs.scheduled.push(ScheduledSequence {
                group_id,
                seq_id: w.seq_id,
                phase: w.phase,
                start_pos,
                token_ids: seq.token_range(start_pos, end_pos),
                num_lookahead_slots: w.num_lookahead_slots,
                draft_token_ids: Vec::new(),
                samples: end_pos >= seq.total_len(),
                block_table: table.get_physical_block_ids().to_vec(),
                slot_mapping: table.slot_mapping_range(start_pos, w.num_tokens()),
            });
            num_tokens += w.num_tokens();
        }

        budget.add_num_batched_tokens(group_id, num_tokens);
        budget.add_num_seqs(group_id, work.len());
        Ok(())
    }

    // ========== Preemption ==========

    fn victim_candidate(&self, group_id: GroupId, admission_rank: usize) -> Option<VictimCandidate> {
        let group = self.groups.get(&group_id)?;
        Some(VictimCandidate {
            group_id,
            priority: self.effective_priority(group),
            admission_rank,
            num_tokens: group.unfinished_seqs().map(Sequence::total_len).sum(),
            num_blocks: BlockSpaceManager::num_group_blocks(group),
        })
    }

    /// Preempt a running group (already removed from the running queue).
    fn preempt(
        &mut self,
        victim: &VictimCandidate,
        outputs: &mut SchedulerOutputs,
        swapper: &mut dyn BlockSwapper,
    ) -> Result<()> {
        let group_id = victim.group_id;
        let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;

        let mut mode = self
            .policy
            .choose_mode(victim, self.block_manager.num_free_cpu_blocks());
        if mode == PreemptionMode::Swap {
            match self.block_manager.swap_out(group, swapper) {
                Ok(mapping) => {
                    for seq in group.unfinished_seqs_mut() {
                        seq.set_swapped()?;
                    }
                    outputs.blocks_to_swap_out.extend(mapping);
                    self.swapped.push_back(group_id);
                }
                Err(err) => {
                    warn!(group_id, %err, "Swap-out failed, preempting by recompute");
                    mode = PreemptionMode::Recompute;
                }
            }
        }
        if mode == PreemptionMode::Recompute {
            Self::reset_for_recompute(&mut self.block_manager, group)?;
            self.waiting.push(PriorityEntry {
                group_id,
                priority: victim.priority,
                arrival_order: group.arrival_order(),
            });
        }

        warn!(group_id, ?mode, tokens = victim.num_tokens, "Preempted group");
        outputs.preempted.push((group_id, mode));
        Ok(())
    }

    /// Drop a group's cache state and mark it waiting. Generated tokens stay.
    fn reset_for_recompute(manager: &mut BlockSpaceManager, group: &mut SequenceGroup) -> Result<()> {
        manager.free_group(group)?;
        for seq in group.unfinished_seqs_mut() {
            seq.reset_for_recompute();
            seq.set_waiting()?;
        }
        Ok(())
    }

    /// Finish a group that can never fit and release its blocks.
    fn ignore_group(
        &mut self,
        group_id: GroupId,
        required_blocks: usize,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let err = Error::CapacityExceeded {
            group_id,
            required_blocks,
            capacity: self.block_manager.gpu_allocator().num_blocks(),
        };
        warn!(%err, "Ignoring group");
        let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;
        for seq in group.unfinished_seqs_mut() {
            seq.set_finished(FinishReason::CapacityExceeded);
        }
        self.block_manager.free_group(group)?;
        self.remove_from_queues(group_id);
        outputs.ignored.push(group_id);
        Ok(())
    }

    fn remove_from_queues(&mut self, group_id: GroupId) {
        self.running.retain(|&id| id != group_id);
        self.swapped.retain(|&id| id != group_id);
        self.waiting.retain(|e| e.group_id != group_id);
    }

    // ========== Lifecycle ==========

    /// Abort one sequence and release its blocks.
    ///
    /// # Returns
    ///
    /// The owning group's ID.
    pub fn abort_seq(&mut self, seq_id: SequenceId) -> Result<GroupId> {
        let group_id = *self
            .seq_to_group
            .get(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?;
        let group = self.groups.get_mut(&group_id).ok_or(Error::GroupNotFound(group_id))?;
        let seq = group.get_seq_mut(seq_id).ok_or(Error::SequenceNotFound(seq_id))?;
        if !seq.status().is_finished() {
            seq.set_finished(FinishReason::Aborted);
            self.block_manager.free_seq(seq)?;
            debug!(seq_id, group_id, "Aborted sequence");
        }
        if group.is_finished() {
            self.remove_from_queues(group_id);
        }
        Ok(group_id)
    }

    /// Abort every sequence of a group.
    pub fn abort_group(&mut self, group_id: GroupId) -> Result<()> {
        let group = self.groups.get(&group_id).ok_or(Error::GroupNotFound(group_id))?;
        let seq_ids: Vec<SequenceId> = group.sequences().iter().map(Sequence::seq_id).collect();
        for seq_id in seq_ids {
            self.abort_seq(seq_id)?;
        }
        Ok(())
    }

    /// Release blocks of finished sequences and remove finished groups.
    ///
    /// # Returns
    ///
    /// The removed groups.
    pub fn free_finished(&mut self) -> Result<Vec<SequenceGroup>> {
        for group in self.groups.values_mut() {
            for seq in group.sequences_mut() {
                if seq.status().is_finished() && !seq.block_table().is_empty() {
                    self.block_manager.free_seq(seq)?;
                }
            }
        }

        let mut finished: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| g.is_finished())
            .map(|(&id, _)| id)
            .collect();
        finished.sort_unstable();

        let mut removed = Vec::with_capacity(finished.len());
        for group_id in finished {
            self.remove_from_queues(group_id);
            if let Some(group) = self.groups.remove(&group_id) {
                for seq in group.sequences() {
                    self.seq_to_group.remove(&seq.seq_id());
                }
                removed.push(group);
            }
        }
        Ok(removed)
    }

    // ========== Accessors ==========

    pub fn get_group(&self, group_id: GroupId) -> Option<&SequenceGroup> {
        self.groups.get(&group_id)
    }

    pub fn get_group_mut(&mut self, group_id: GroupId) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(&group_id)
    }

    /// A group together with the block manager, for post-step bookkeeping.
    pub fn group_and_manager_mut(
        &mut self,
        group_id: GroupId,
    ) -> Option<(&mut SequenceGroup, &mut BlockSpaceManager)> {
        let group = self.groups.get_mut(&group_id)?;
        Some((group, &mut self.block_manager))
    }

    pub fn group_of(&self, seq_id: SequenceId) -> Option<GroupId> {
        self.seq_to_group.get(&seq_id).copied()
    }

    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.groups.get(&self.group_of(seq_id)?)?.get_seq(seq_id)
    }

    /// Waiting group IDs in admission order.
    pub fn waiting_group_ids(&self) -> Vec<GroupId> {
        let mut entries: Vec<PriorityEntry> = self.waiting.iter().cloned().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.group_id).collect()
    }

    /// Running group IDs in admission order.
    pub fn running_group_ids(&self) -> Vec<GroupId> {
        self.running.iter().copied().collect()
    }

    /// Swapped group IDs, oldest swap first.
    pub fn swapped_group_ids(&self) -> Vec<GroupId> {
        self.swapped.iter().copied().collect()
    }

    /// Status shared by a group's unfinished sequences.
    pub fn group_status(&self, group_id: GroupId) -> Option<SequenceStatus> {
        let group = self.groups.get(&group_id)?;
        Some(
            group
                .unfinished_seqs()
                .next()
                .map_or(SequenceStatus::Finished, Sequence::status),
        )
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    /// Check if scheduler has any unfinished groups.
    pub fn has_unfinished_groups(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.swapped.is_empty()
    }

    pub fn block_manager(&self) -> &BlockSpaceManager {
        &self.block_manager
    }

    pub fn block_manager_mut(&mut self) -> &mut BlockSpaceManager {
        &mut self.block_manager
    }

    /// Drop every group and free both pools.
    pub fn reset(&mut self) {
        self.groups.clear();
        self.seq_to_group.clear();
        self.waiting.clear();
        self.running.clear();
        self.swapped.clear();
        self.block_manager.reset();
        self.arrival_counter = 0;
    }
}
