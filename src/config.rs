//! Configuration types for paged-serve.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::block::compute_num_blocks;
use crate::error::{Error, Result};
use crate::scheduler::policy::PreemptionConfig;
use crate::speculative::SpeculativeConfig;

/// KV cache pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    /// Number of blocks in the GPU pool.
    pub num_gpu_blocks: usize,
    /// Number of blocks in the host (CPU) swap pool. Zero disables swapping.
    pub num_cpu_blocks: usize,
    /// Share identical prompt-prefix blocks across sequences.
    pub enable_prefix_caching: bool,
    /// GPU blocks kept free when admitting or swapping in.
    pub watermark_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_gpu_blocks: 1024,
            num_cpu_blocks: 512,
            enable_prefix_caching: true,
            watermark_blocks: 0,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences in one batch.
    pub max_num_seqs: usize,
    /// Maximum number of tokens processed in one step.
    pub max_num_batched_tokens: usize,
    /// Maximum length (prompt + output) of any sequence.
    pub max_model_len: usize,
    /// Enable chunked prefill for long prompts.
    pub enable_chunked_prefill: bool,
    /// Chunk size for chunked prefill.
    pub chunk_size: usize,
    /// Order the waiting queue by priority before arrival.
    pub enable_priority: bool,
    /// Victim selection and swap/recompute choice.
    pub preemption: PreemptionConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 4096,
            max_model_len: 2048,
            enable_chunked_prefill: true,
            chunk_size: 512,
            enable_priority: false,
            preemption: PreemptionConfig::default(),
        }
    }
}

/// Per-request generation limits.
///
/// Sampling itself (temperature, top-k, ...) belongs to the compute
/// collaborator; the core only needs to know how many sequences a request
/// fans out to and when to stop them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of sequences generated from the prompt.
    pub n: usize,
    /// Maximum tokens to generate per sequence.
    pub max_tokens: usize,
    /// Token ids that end a sequence.
    pub stop_token_ids: Vec<u32>,
    /// End-of-sequence token of the model, if any.
    pub eos_token_id: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n: 1,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
            eos_token_id: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// KV cache pools.
    pub cache: CacheConfig,
    /// Scheduler limits.
    pub scheduler: SchedulerConfig,
    /// Speculative decoding; `None` disables it.
    pub speculative: Option<SpeculativeConfig>,
}

impl EngineConfig {
    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Tokens each decoding sequence may need beyond its current token.
    pub fn lookahead_slots(&self) -> usize {
        self.speculative
            .as_ref()
            .map_or(0, |spec| spec.num_speculative_tokens)
    }

    /// Check that the configuration describes a usable engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero-sized limits or a GPU pool that
    /// cannot hold a single sequence of `max_model_len` tokens.
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        let sched = &self.scheduler;

        if cache.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if sched.max_num_seqs == 0 || sched.max_num_batched_tokens == 0 {
            return Err(Error::Config(
                "max_num_seqs and max_num_batched_tokens must be positive".into(),
            ));
        }
        if sched.max_model_len == 0 {
            return Err(Error::Config("max_model_len must be positive".into()));
        }
        if sched.enable_chunked_prefill && sched.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if !sched.enable_chunked_prefill && sched.max_num_batched_tokens < sched.max_model_len {
            return Err(Error::Config(format!(
                "max_num_batched_tokens ({}) is smaller than max_model_len ({}) without chunked prefill",
                sched.max_num_batched_tokens, sched.max_model_len
            )));
        }

        let needed = compute_num_blocks(sched.max_model_len, cache.block_size);
        if cache.num_gpu_blocks < needed + cache.watermark_blocks {
            return Err(Error::Config(format!(
                "GPU pool of {} blocks cannot hold one sequence of {} tokens ({} blocks + {} watermark)",
                cache.num_gpu_blocks, sched.max_model_len, needed, cache.watermark_blocks
            )));
        }

        if let Some(spec) = &self.speculative {
            if spec.num_speculative_tokens == 0 {
                return Err(Error::Config(
                    "num_speculative_tokens must be positive when speculative decoding is enabled"
                        .into(),
                ));
            }
        }

        Ok(())
    }
}
