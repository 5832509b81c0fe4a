//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FCFS / priority admission of waiting groups
//! - Continuous batching (iteration-level scheduling)
//! - Preemption by swapping or recomputation under memory pressure

pub mod batch;
pub mod budget;
pub mod policy;

pub use batch::{ScheduledSequence, Scheduler, SchedulerOutputs};
pub use budget::SchedulingBudget;
pub use policy::{
    CostModelPolicy, FixedPolicy, PreemptionConfig, PreemptionMode, PreemptionPolicy,
    VictimCandidate,
};
