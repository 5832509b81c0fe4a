//! paged-serve: the memory and scheduling core of an LLM serving engine.
//!
//! This crate implements:
//! - A paged KV cache with reference-counted blocks, copy-on-write and
//!   host swap space
//! - Prefix caching for shared prompts
//! - Continuous batching with chunked prefill and preemption
//! - Speculative decoding with modified rejection sampling

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;

pub use config::{CacheConfig, EngineConfig, SamplingConfig, SchedulerConfig};
pub use crate::core::block::{BlockDevice, BlockId, BlockTable};
pub use crate::core::block_manager::{AllocationStatus, BlockSpaceManager};
pub use crate::core::sequence::{
    FinishReason, GroupId, Sequence, SequenceGroup, SequenceId, SequencePhase, SequenceStatus,
};
pub use engine::{
    AbortHandle, BlockSwapper, DraftProposal, DraftProposer, GenerationRequest, LLMEngine,
    ModelExecutor, RequestHandle, SequenceOutput, StepOutput,
};
pub use error::{Error, Result};
pub use scheduler::{PreemptionConfig, PreemptionMode, Scheduler, SchedulerOutputs};
pub use speculative::{RejectionSampler, SpecDecodeStats, SpeculativeConfig, SpeculativeCoordinator};
