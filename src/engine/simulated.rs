//! Deterministic in-process collaborators.
//!
//! A toy "model" over a small vocabulary stands in for the compute,
//! draft and swap collaborators. It writes token ids into a [`CacheStore`] at
//! the slots the scheduler hands out, so tests can check that every
//! sequence's cache content matches its tokens after preemption, swapping and
//! copy-on-write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use super::executor::{
    BatchDescriptor, BlockSwapper, DraftProposal, DraftProposer, ModelExecutor, SequenceOutput,
};
use crate::core::block::{BlockDevice, BlockId};
use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};

/// Stand-in for the KV cache tensors: one token id per slot.
#[derive(Debug, Clone)]
pub struct CacheStore {
    block_size: usize,
    blocks: HashMap<(BlockDevice, BlockId), Vec<Option<u32>>>,
}

/// Cache store shared between the executor and the swapper.
pub type SharedCacheStore = Arc<Mutex<CacheStore>>;

impl CacheStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
        }
    }

    pub fn shared(block_size: usize) -> SharedCacheStore {
        Arc::new(Mutex::new(Self::new(block_size)))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Write the entry of a global slot (`block_id * block_size + offset`).
    pub fn write_slot(&mut self, device: BlockDevice, slot: usize, token_id: u32) {
        let block_size = self.block_size;
        let entries = self
            .blocks
            .entry((device, slot / block_size))
            .or_insert_with(|| vec![None; block_size]);
        entries[slot % block_size] = Some(token_id);
    }

    pub fn read_slot(&self, device: BlockDevice, slot: usize) -> Option<u32> {
        self.blocks
            .get(&(device, slot / self.block_size))
            .and_then(|entries| entries[slot % self.block_size])
    }

    /// Overwrite `dst` with the content of `src`.
    pub fn copy_block(&mut self, src: (BlockDevice, BlockId), dst: (BlockDevice, BlockId)) {
        match self.blocks.get(&src).cloned() {
            Some(entries) => {
                self.blocks.insert(dst, entries);
            }
            None => {
                self.blocks.remove(&dst);
            }
        }
    }

    /// Read the first `len` positions of a sequence through its block table.
    pub fn read_tokens(&self, device: BlockDevice, block_ids: &[BlockId], len: usize) -> Vec<Option<u32>> {
        (0..len)
            .map(|pos| {
                block_ids
                    .get(pos / self.block_size)
                    .and_then(|&block_id| self.read_slot(device, block_id * self.block_size + pos % self.block_size))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// Next-token distribution of the toy model after `token_id` at `pos`.
///
/// Half the mass is spread uniformly, the other half sits on one token
/// derived from the input.
pub fn simulated_distribution(vocab_size: usize, token_id: u32, pos: usize) -> Vec<f32> {
    let favored = (token_id as usize * 31 + pos * 17 + 7) % vocab_size;
    let mut probs = vec![0.5 / vocab_size as f32; vocab_size];
    probs[favored] += 0.5;
    probs
}

fn sample_from(rng: &mut StdRng, probs: &[f32]) -> Result<u32> {
    let dist = WeightedIndex::new(probs).map_err(|e| Error::InvalidDistribution(e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// Target model over [`simulated_distribution`].
#[derive(Debug)]
pub struct SimulatedExecutor {
    vocab_size: usize,
    rng: StdRng,
    store: SharedCacheStore,
    num_steps: u64,
}

impl SimulatedExecutor {
    pub fn new(vocab_size: usize, seed: u64, store: SharedCacheStore) -> Self {
        Self {
            vocab_size,
            rng: StdRng::seed_from_u64(seed),
            store,
            num_steps: 0,
        }
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    pub fn store(&self) -> &SharedCacheStore {
        &self.store
    }
}

impl ModelExecutor for SimulatedExecutor {
    fn run_step(&mut self, batch: &BatchDescriptor) -> Result<Vec<SequenceOutput>> {
        let mut store = self.store.lock();
        for &(src, dst) in &batch.blocks_to_copy {
            store.copy_block((BlockDevice::Gpu, src), (BlockDevice::Gpu, dst));
        }

        let mut outputs = Vec::with_capacity(batch.scheduled.len());
        for s in &batch.scheduled {
            let inputs: Vec<u32> = s.token_ids.iter().chain(&s.draft_token_ids).copied().collect();
            for (i, &token_id) in inputs.iter().enumerate() {
                let slot = *s.slot_mapping.get(i).ok_or_else(|| {
                    Error::Executor(format!("sequence {} has no slot for input {i}", s.seq_id))
                })?;
                store.write_slot(BlockDevice::Gpu, slot, token_id);
            }

            let Some(&last) = s.token_ids.last() else {
                return Err(Error::Executor(format!("sequence {} scheduled without tokens", s.seq_id)));
            };
            let last_pos = s.start_pos + s.token_ids.len() - 1;

            if !s.draft_token_ids.is_empty() {
                let target_probs = iter_positions(last, &s.draft_token_ids)
                    .enumerate()
                    .map(|(j, token_id)| simulated_distribution(self.vocab_size, token_id, last_pos + j))
                    .collect();
                outputs.push(SequenceOutput {
                    seq_id: s.seq_id,
                    token_id: None,
                    target_probs,
                });
            } else if s.samples {
                let probs = simulated_distribution(self.vocab_size, last, last_pos);
                outputs.push(SequenceOutput::token(s.seq_id, sample_from(&mut self.rng, &probs)?));
            } else {
                outputs.push(SequenceOutput::empty(s.seq_id));
            }
        }

        self.num_steps += 1;
        trace!(step = self.num_steps, sequences = outputs.len(), "Simulated forward pass");
        Ok(outputs)
    }
}

/// The token at each verified position: the last confirmed token, then
/// every draft token.
fn iter_positions(last: u32, drafts: &[u32]) -> impl Iterator<Item = u32> + '_ {
    std::iter::once(last).chain(drafts.iter().copied())
}

/// Draft model: a flattened copy of the target distribution.
#[derive(Debug)]
pub struct SimulatedDraft {
    vocab_size: usize,
    rng: StdRng,
    unavailable: HashSet<SequenceId>,
}

impl SimulatedDraft {
    pub fn new(vocab_size: usize, seed: u64) -> Self {
        Self {
            vocab_size,
            rng: StdRng::seed_from_u64(seed),
            unavailable: HashSet::new(),
        }
    }

    /// Make proposals for `seq_id` fail with `DraftUnavailable`.
    pub fn set_unavailable(&mut self, seq_id: SequenceId) {
        self.unavailable.insert(seq_id);
    }

    fn draft_distribution(&self, token_id: u32, pos: usize) -> Vec<f32> {
        let uniform = 1.0 / self.vocab_size as f32;
        simulated_distribution(self.vocab_size, token_id, pos)
            .into_iter()
            .map(|p| 0.5 * p + 0.5 * uniform)
            .collect()
    }
}

impl DraftProposer for SimulatedDraft {
    fn propose(&mut self, seq_id: SequenceId, context: &[u32], k: usize) -> Result<DraftProposal> {
        if self.unavailable.contains(&seq_id) {
            return Err(Error::DraftUnavailable {
                seq_id,
                reason: "draft model offline".into(),
            });
        }
        let Some(&last) = context.last() else {
            return Err(Error::DraftUnavailable {
                seq_id,
                reason: "empty context".into(),
            });
        };

        let mut proposal = DraftProposal::default();
        let mut token_id = last;
        for j in 0..k {
            let probs = self.draft_distribution(token_id, context.len() - 1 + j);
            token_id = sample_from(&mut self.rng, &probs)?;
            proposal.token_ids.push(token_id);
            proposal.probs.push(probs);
        }
        Ok(proposal)
    }
}

/// Swap collaborator copying blocks inside a [`CacheStore`].
#[derive(Debug)]
pub struct HostSwapper {
    store: SharedCacheStore,
    failures_left: usize,
    num_copies: usize,
}

impl HostSwapper {
    pub fn new(store: SharedCacheStore) -> Self {
        Self {
            store,
            failures_left: 0,
            num_copies: 0,
        }
    }

    /// Fail the next `n` copies.
    pub fn fail_next(&mut self, n: usize) {
        self.failures_left = n;
    }

    /// Completed copies.
    pub fn num_copies(&self) -> usize {
        self.num_copies
    }
}

impl BlockSwapper for HostSwapper {
    fn copy(&mut self, src: (BlockDevice, BlockId), dst: (BlockDevice, BlockId)) -> Result<()> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(Error::SwapFailure(format!("injected failure copying {} block {}", src.0, src.1)));
        }
        self.store.lock().copy_block(src, dst);
        self.num_copies += 1;
        Ok(())
    }
}
