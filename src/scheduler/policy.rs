//! Preemption policies.
//!
//! When a running group cannot grow, the scheduler asks a
//! [`PreemptionPolicy`] two questions: which running group to evict, and
//! whether to evict it by swapping its blocks to host memory or by dropping
//! them and recomputing later.
//!
//! ```text
//!   victim ── short / host full ──► Recompute  (free blocks, back to WAITING)
//!          └─ long and host room ─► Swap       (copy to CPU pool, SWAPPED)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::sequence::{GroupId, Priority};

/// How a victim is preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Move blocks to the host pool and resume later with state intact.
    Swap,
    /// Free all blocks and prefill again from the tokens.
    Recompute,
}

/// What a policy knows about a running group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimCandidate {
    pub group_id: GroupId,
    pub priority: Priority,
    /// Position in the running queue; higher means admitted more recently.
    pub admission_rank: usize,
    /// Tokens that would have to be recomputed.
    pub num_tokens: usize,
    /// Distinct GPU blocks that would have to be swapped.
    pub num_blocks: usize,
}

/// Victim selection and swap/recompute choice.
pub trait PreemptionPolicy: fmt::Debug + Send + Sync {
    /// Pick the victim among `candidates`, returning its index.
    ///
    /// The default picks the lowest priority, then the most recently
    /// admitted group.
    fn select_victim(&self, candidates: &[VictimCandidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.admission_rank.cmp(&a.admission_rank))
            })
            .map(|(idx, _)| idx)
    }

    /// Decide how to preempt `victim` given the free host blocks.
    fn choose_mode(&self, victim: &VictimCandidate, free_cpu_blocks: usize) -> PreemptionMode;
}

/// Always use one mode; swap falls back to recompute when the host pool is full.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy {
    mode: PreemptionMode,
}

impl FixedPolicy {
    pub fn new(mode: PreemptionMode) -> Self {
        Self { mode }
    }
}

impl PreemptionPolicy for FixedPolicy {
    fn choose_mode(&self, victim: &VictimCandidate, free_cpu_blocks: usize) -> PreemptionMode {
        match self.mode {
            PreemptionMode::Swap if victim.num_blocks <= free_cpu_blocks => PreemptionMode::Swap,
            _ => PreemptionMode::Recompute,
        }
    }
}

/// Recompute short groups, swap long ones while the host pool has room.
///
/// Recomputing costs a prefill over every token of the group; swapping
/// costs two copies of its blocks. Below `recompute_threshold_tokens` the
/// prefill is assumed cheaper.
#[derive(Debug, Clone, Copy)]
pub struct CostModelPolicy {
    recompute_threshold_tokens: usize,
}

impl CostModelPolicy {
    pub fn new(recompute_threshold_tokens: usize) -> Self {
        Self {
            recompute_threshold_tokens,
        }
    }

    pub fn recompute_threshold_tokens(&self) -> usize {
        self.recompute_threshold_tokens
    }
}

impl PreemptionPolicy for CostModelPolicy {
    fn choose_mode(&self, victim: &VictimCandidate, free_cpu_blocks: usize) -> PreemptionMode {
        if victim.num_tokens >= self.recompute_threshold_tokens && victim.num_blocks <= free_cpu_blocks {
            PreemptionMode::Swap
        } else {
            PreemptionMode::Recompute
        }
    }
}

/// Serializable choice of the built-in policies.
///
/// ```
/// use paged_serve::scheduler::policy::PreemptionConfig;
///
/// let config: PreemptionConfig =
///     serde_json::from_str(r#"{ "mode": "cost_model", "recompute_threshold_tokens": 64 }"#).unwrap();
/// assert_eq!(config, PreemptionConfig::CostModel { recompute_threshold_tokens: 64 });
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PreemptionConfig {
    Recompute,
    Swap,
    CostModel { recompute_threshold_tokens: usize },
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self::CostModel {
            recompute_threshold_tokens: 128,
        }
    }
}

impl PreemptionConfig {
    /// Instantiate the configured policy.
    pub fn build(&self) -> Box<dyn PreemptionPolicy> {
        match *self {
            Self::Recompute => Box::new(FixedPolicy::new(PreemptionMode::Recompute)),
            Self::Swap => Box::new(FixedPolicy::new(PreemptionMode::Swap)),
            Self::CostModel {
                recompute_threshold_tokens,
            } => Box::new(CostModelPolicy::new(recompute_threshold_tokens)),
        }
    }
}
