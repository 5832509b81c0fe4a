//! LLM serving engine.
//!
//! The LLMEngine drives one scheduling + compute cycle per [`LLMEngine::step`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         LLMEngine                           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!           submit()         │    step()
//!                ▼           │           ▼
//!         ┌──────────┐       │    ┌──────────────┐
//!         │ Scheduler│       │    │ drain aborts │
//!         │   add    │       │    └──────────────┘
//!         └──────────┘       │           │
//!                            │           ▼
//!                            │    ┌──────────────┐     ┌──────────────┐
//!                            │    │  Scheduler   │ ──► │ BlockSwapper │
//!                            │    │  schedule    │     └──────────────┘
//!                            │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │ Draft propose│   (speculative only)
//!                            │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │ModelExecutor │
//!                            │    │   run_step   │
//!                            │    └──────────────┘
//!                            │           │
//!                            │           ▼
//!                            │    ┌──────────────┐
//!                            │    │ commit tokens│  verify drafts, truncate,
//!                            │    │ stop checks  │  seal blocks, free finished
//!                            │    └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::executor::{BlockSwapper, DraftProposer, ModelExecutor, SequenceOutput};
use crate::config::{EngineConfig, SamplingConfig};
use crate::core::sequence::{
    FinishReason, GroupId, Priority, Sequence, SequenceGroup, SequenceId, SequenceStatus,
    DEFAULT_PRIORITY,
};
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledSequence, Scheduler, SchedulerOutputs};
use crate::speculative::{SpecDecodeStats, SpeculativeCoordinator};

/// Request for generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt token ids.
    pub prompt_token_ids: Vec<u32>,
    /// Sampling configuration for this request.
    pub sampling_config: SamplingConfig,
    /// Priority (higher = more important).
    pub priority: Priority,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            sampling_config: SamplingConfig::default(),
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling_config.max_tokens = max_tokens;
        self
    }

    /// Set the number of sequences sampled from the prompt.
    pub fn n(mut self, n: usize) -> Self {
        self.sampling_config.n = n;
        self
    }

    /// Set tokens that end a sequence.
    pub fn stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.sampling_config.stop_token_ids = stop_token_ids;
        self
    }

    /// Set the end-of-sequence token.
    pub fn eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.sampling_config.eos_token_id = Some(eos_token_id);
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Identifies a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHandle {
    pub group_id: GroupId,
    /// One sequence per sample, in order.
    pub seq_ids: Vec<SequenceId>,
}

/// What one step did to one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub group_id: GroupId,
    pub seq_id: SequenceId,
    /// Tokens committed this step.
    pub new_token_ids: Vec<u32>,
    pub status: SequenceStatus,
    pub finish_reason: Option<FinishReason>,
}

impl StepOutput {
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// Marks sequences for abort from any thread. Marks take effect at the
/// next step boundary, never during a step.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    marks: Arc<Mutex<Vec<SequenceId>>>,
}

impl AbortHandle {
    pub fn abort(&self, seq_id: SequenceId) {
        self.marks.lock().push(seq_id);
    }

    fn drain(&self) -> Vec<SequenceId> {
        std::mem::take(&mut *self.marks.lock())
    }
}

/// LLM serving engine.
///
/// Orchestrates the scheduler, the compute collaborator and, when
/// configured, speculative decoding.
pub struct LLMEngine {
    config: EngineConfig,
    scheduler: Scheduler,
    executor: Box<dyn ModelExecutor>,
    swapper: Box<dyn BlockSwapper>,
    draft: Option<Box<dyn DraftProposer>>,
    coordinator: Option<SpeculativeCoordinator>,
    abort_handle: AbortHandle,
    /// Counters for IDs.
    next_group_id: GroupId,
    next_seq_id: SequenceId,
    num_steps: u64,
}

impl LLMEngine {
    /// Create an engine without speculative decoding.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration is unusable, e.g. a GPU pool
    /// smaller than one sequence of `max_model_len` tokens.
    pub fn new(
        config: EngineConfig,
        executor: Box<dyn ModelExecutor>,
        swapper: Box<dyn BlockSwapper>,
    ) -> Result<Self> {
        Self::build(config, executor, swapper, None)
    }

    /// Create an engine with a draft collaborator. Speculation is enabled
    /// when `config.speculative` is set.
    pub fn with_draft(
        config: EngineConfig,
        executor: Box<dyn ModelExecutor>,
        swapper: Box<dyn BlockSwapper>,
        draft: Box<dyn DraftProposer>,
    ) -> Result<Self> {
        Self::build(config, executor, swapper, Some(draft))
    }

    fn build(
        config: EngineConfig,
        executor: Box<dyn ModelExecutor>,
        swapper: Box<dyn BlockSwapper>,
        draft: Option<Box<dyn DraftProposer>>,
    ) -> Result<Self> {
        config.validate()?;

        let coordinator = match (&config.speculative, &draft) {
            (Some(spec), Some(_)) => Some(SpeculativeCoordinator::new(spec.clone())),
            _ => None,
        };
        let lookahead = if coordinator.is_some() {
            config.lookahead_slots()
        } else {
            0
        };
        let scheduler = Scheduler::new(config.scheduler.clone(), &config.cache, lookahead);

        info!(
            block_size = config.cache.block_size,
            gpu_blocks = config.cache.num_gpu_blocks,
            cpu_blocks = config.cache.num_cpu_blocks,
            lookahead,
            "Engine ready"
        );

        Ok(Self {
            config,
            scheduler,
            executor,
            swapper,
            draft,
            coordinator,
            abort_handle: AbortHandle::default(),
            next_group_id: 0,
            next_seq_id: 0,
            num_steps: 0,
        })
    }

    /// Enqueue a request.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an empty prompt, `n == 0`, `max_tokens == 0`,
    /// or a prompt that leaves no room below `max_model_len`.
    pub fn submit(&mut self, request: GenerationRequest) -> Result<RequestHandle> {
        let prompt_len = request.prompt_token_ids.len();
        if prompt_len == 0 {
            return Err(Error::Config("empty prompt".into()));
        }
        if request.sampling_config.n == 0 || request.sampling_config.max_tokens == 0 {
            return Err(Error::Config("n and max_tokens must be positive".into()));
        }
        let max_model_len = self.config.scheduler.max_model_len;
        if prompt_len >= max_model_len {
            return Err(Error::Config(format!(
                "prompt of {prompt_len} tokens does not fit max_model_len {max_model_len}"
            )));
        }

        let group_id = self.next_group_id;
        self.next_group_id += 1;
        let first_seq_id = self.next_seq_id;
        self.next_seq_id += request.sampling_config.n as SequenceId;

        let group = SequenceGroup::new(
            group_id,
            first_seq_id,
            request.prompt_token_ids,
            request.sampling_config,
            self.config.cache.block_size,
        )
        .with_priority(request.priority);
        let seq_ids = group.sequences().iter().map(Sequence::seq_id).collect();

        debug!(group_id, prompt_len, "Submitted request");
        self.scheduler.add_group(group);
        Ok(RequestHandle { group_id, seq_ids })
    }

    /// Abort a sequence now. Only valid between steps, which `&mut self`
    /// guarantees; other threads use an [`AbortHandle`].
    pub fn abort(&mut self, seq_id: SequenceId) -> Result<()> {
        self.scheduler.abort_seq(seq_id)?;
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.forget(seq_id);
        }
        Ok(())
    }

    /// A handle that marks sequences for abort at the next step boundary.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Run one scheduling and compute cycle.
    ///
    /// # Returns
    ///
    /// One entry per sequence that committed tokens, finished, or was
    /// aborted or rejected this step. A sequence whose result cannot be
    /// applied is logged and left to run again; the others still commit.
    #[instrument(skip_all, fields(step = self.num_steps))]
    pub fn step(&mut self) -> Result<Vec<StepOutput>> {
        self.num_steps += 1;
        let mut results = Vec::new();

        self.drain_aborts(&mut results)?;
        self.scheduler.free_finished()?;

        let mut batch = self.scheduler.schedule(self.swapper.as_mut())?;
        self.report_ignored(&batch, &mut results)?;
        if batch.is_empty() {
            return Ok(results);
        }

        self.propose_drafts(&mut batch)?;

        let outputs = match self.executor.run_step(&batch) {
            Ok(outputs) => outputs,
            Err(err) => {
                self.cancel_drafts(&batch)?;
                return Err(err);
            }
        };
        let mut outputs: HashMap<SequenceId, SequenceOutput> =
            outputs.into_iter().map(|o| (o.seq_id, o)).collect();
        if let Some(missing) = batch.scheduled.iter().find(|s| !outputs.contains_key(&s.seq_id)) {
            let seq_id = missing.seq_id;
            self.cancel_drafts(&batch)?;
            return Err(Error::Executor(format!("no output for sequence {seq_id}")));
        }

        for scheduled in &batch.scheduled {
            let Some(output) = outputs.remove(&scheduled.seq_id) else {
                continue;
            };
            match self.commit(scheduled, output) {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err) => {
                    // The sequence keeps its computed prefix and is scheduled again.
                    warn!(seq_id = scheduled.seq_id, %err, "Discarding step result");
                    self.cancel_draft(scheduled)?;
                }
            }
        }

        self.scheduler.free_finished()?;
        Ok(results)
    }

    /// Step until every submitted request has finished.
    pub fn generate(&mut self) -> Result<Vec<StepOutput>> {
        let mut all_outputs = Vec::new();
        while self.has_unfinished_requests() {
            all_outputs.extend(self.step()?);
        }
        Ok(all_outputs)
    }

    fn drain_aborts(&mut self, results: &mut Vec<StepOutput>) -> Result<()> {
        for seq_id in self.abort_handle.drain() {
            let Some(group_id) = self.scheduler.group_of(seq_id) else {
                debug!(seq_id, "Abort for unknown sequence ignored");
                continue;
            };
            let already_finished = self
                .scheduler
                .get_sequence(seq_id)
                .map_or(true, |seq| seq.status().is_finished());
            self.abort(seq_id)?;
            if !already_finished {
                results.push(StepOutput {
                    group_id,
                    seq_id,
                    new_token_ids: Vec::new(),
                    status: SequenceStatus::Aborted,
                    finish_reason: Some(FinishReason::Aborted),
                });
            }
        }
        Ok(())
    }

    fn report_ignored(&self, batch: &SchedulerOutputs, results: &mut Vec<StepOutput>) -> Result<()> {
        for &group_id in &batch.ignored {
            let group = self
                .scheduler
                .get_group(group_id)
                .ok_or(Error::GroupNotFound(group_id))?;
            for seq in group.sequences() {
                if seq.finish_reason() == Some(FinishReason::CapacityExceeded) {
                    results.push(StepOutput {
                        group_id,
                        seq_id: seq.seq_id(),
                        new_token_ids: Vec::new(),
                        status: seq.status(),
                        finish_reason: seq.finish_reason(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fill the lookahead slots of decoding sequences with draft tokens.
    fn propose_drafts(&mut self, batch: &mut SchedulerOutputs) -> Result<()> {
        let (Some(coordinator), Some(draft)) = (self.coordinator.as_mut(), self.draft.as_mut()) else {
            return Ok(());
        };

        let mut dropped = 0;
        for scheduled in batch.scheduled.iter_mut().filter(|s| s.num_lookahead_slots > 0) {
            let (group, manager) = self
                .scheduler
                .group_and_manager_mut(scheduled.group_id)
                .ok_or(Error::GroupNotFound(scheduled.group_id))?;
            let seq = group
                .get_seq_mut(scheduled.seq_id)
                .ok_or(Error::SequenceNotFound(scheduled.seq_id))?;

            let tokens = coordinator.propose(draft.as_mut(), manager, seq, scheduled.num_lookahead_slots)?;
            dropped += scheduled.num_lookahead_slots - tokens.len();
            scheduled.num_lookahead_slots = tokens.len();
            scheduled.slot_mapping.truncate(scheduled.token_ids.len() + tokens.len());
            scheduled.block_table = seq.block_table().get_physical_block_ids().to_vec();
            scheduled.draft_token_ids = tokens;
        }
        batch.num_decode_tokens -= dropped;
        Ok(())
    }

    fn cancel_drafts(&mut self, batch: &SchedulerOutputs) -> Result<()> {
        for scheduled in &batch.scheduled {
            self.cancel_draft(scheduled)?;
        }
        Ok(())
    }

    fn cancel_draft(&mut self, scheduled: &ScheduledSequence) -> Result<()> {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return Ok(());
        };
        if scheduled.draft_token_ids.is_empty() {
            return Ok(());
        }
        if let Some((group, manager)) = self.scheduler.group_and_manager_mut(scheduled.group_id) {
            if let Some(seq) = group.get_seq_mut(scheduled.seq_id) {
                coordinator.cancel(manager, seq)?;
            }
        }
        Ok(())
    }

    /// Apply one sequence's step result.
    fn commit(&mut self, scheduled: &ScheduledSequence, output: SequenceOutput) -> Result<Option<StepOutput>> {
        let group_id = scheduled.group_id;
        let seq_id = scheduled.seq_id;
        let max_model_len = self.config.scheduler.max_model_len;
        let (group, manager) = self
            .scheduler
            .group_and_manager_mut(group_id)
            .ok_or(Error::GroupNotFound(group_id))?;
        let sampling = group.sampling().clone();
        let is_first_token_of_leader =
            group.leader().is_some_and(|l| l.seq_id() == seq_id && l.output_len() == 0);

        let seq = group.get_seq_mut(seq_id).ok_or(Error::SequenceNotFound(seq_id))?;
        if seq.status() != SequenceStatus::Running {
            return Ok(None);
        }

        let verified = !scheduled.draft_token_ids.is_empty();
        let (emitted, num_accepted) = if !verified {
            match (scheduled.samples, output.token_id) {
                (true, Some(token_id)) => (vec![token_id], 0),
                (true, None) => {
                    return Err(Error::Executor(format!("no token sampled for sequence {seq_id}")));
                }
                (false, _) => (Vec::new(), 0),
            }
        } else {
            let coordinator = self
                .coordinator
                .as_mut()
                .ok_or(Error::DraftUnavailable {
                    seq_id,
                    reason: "speculative decoding disabled".into(),
                })?;
            let reconciliation = coordinator.verify_and_reconcile(manager, seq, &output.target_probs)?;
            let num_accepted = reconciliation.verification.num_accepted();
            (reconciliation.verification.emitted(), num_accepted)
        };

        let mut new_token_ids = Vec::with_capacity(emitted.len());
        let mut finish_reason = None;
        for token_id in emitted {
            seq.append_token(token_id);
            new_token_ids.push(token_id);
            finish_reason = check_stop(&sampling, seq, token_id, max_model_len);
            if finish_reason.is_some() {
                break;
            }
        }
        seq.mark_computed(scheduled.token_ids.len() + num_accepted);
        if verified {
            if let Some(coordinator) = self.coordinator.as_mut() {
                coordinator.record_emitted(new_token_ids.len());
            }
        }

        if is_first_token_of_leader && !new_token_ids.is_empty() {
            group.release_followers();
        }

        let seq = group.get_seq_mut(seq_id).ok_or(Error::SequenceNotFound(seq_id))?;
        match finish_reason {
            Some(reason) => {
                seq.set_finished(reason);
                manager.free_seq(seq)?;
                debug!(seq_id, ?reason, output_len = seq.output_len(), "Sequence finished");
            }
            None => {
                manager.seal_completed_blocks(seq)?;
            }
        }

        if new_token_ids.is_empty() && finish_reason.is_none() {
            return Ok(None);
        }
        Ok(Some(StepOutput {
            group_id,
            seq_id,
            new_token_ids,
            status: seq.status(),
            finish_reason: seq.finish_reason(),
        }))
    }

    // ========== Introspection ==========

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.scheduler.get_sequence(seq_id)
    }

    /// Check if any submitted request is still waiting, running or swapped.
    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_groups()
    }

    pub fn num_waiting(&self) -> usize {
        self.scheduler.num_waiting()
    }

    pub fn num_running(&self) -> usize {
        self.scheduler.num_running()
    }

    pub fn num_swapped(&self) -> usize {
        self.scheduler.num_swapped()
    }

    pub fn num_free_gpu_blocks(&self) -> usize {
        self.scheduler.block_manager().num_free_gpu_blocks()
    }

    pub fn num_free_cpu_blocks(&self) -> usize {
        self.scheduler.block_manager().num_free_cpu_blocks()
    }

    pub fn prefix_cache_hit_rate(&self) -> f64 {
        self.scheduler.block_manager().prefix_cache_stats().hit_rate()
    }

    /// Speculative decoding counters, if enabled.
    pub fn spec_decode_stats(&self) -> Option<SpecDecodeStats> {
        self.coordinator.as_ref().map(SpeculativeCoordinator::stats)
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }
}

/// Check whether `seq` must stop after committing `token_id`.
fn check_stop(
    sampling: &SamplingConfig,
    seq: &Sequence,
    token_id: u32,
    max_model_len: usize,
) -> Option<FinishReason> {
    if sampling.eos_token_id == Some(token_id) {
        Some(FinishReason::EndOfSequence)
    } else if sampling.stop_token_ids.contains(&token_id) {
        Some(FinishReason::StopToken)
    } else if seq.output_len() >= sampling.max_tokens {
        Some(FinishReason::MaxTokens)
    } else if seq.total_len() >= max_model_len {
        Some(FinishReason::MaxModelLen)
    } else {
        None
    }
}
