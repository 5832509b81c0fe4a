//! Serving engine.
//!
//! This module contains:
//! - LLMEngine for driving scheduling and compute steps
//! - Collaborator traits for the forward pass, drafts and swapping
//! - Simulated collaborators for tests and the demo binary

pub mod executor;
pub mod llm;
pub mod simulated;

pub use executor::{
    BatchDescriptor, BlockSwapper, DraftProposal, DraftProposer, ModelExecutor, SequenceOutput,
};
pub use llm::{AbortHandle, GenerationRequest, LLMEngine, RequestHandle, StepOutput};
