//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// A draft collaborator proposes up to K tokens per decoding sequence, which
/// the target model then verifies in a single pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of tokens to speculate per iteration (K).
    /// Higher values can improve throughput if acceptance rate is high,
    /// but waste cache slots and compute if many tokens are rejected.
    pub num_speculative_tokens: usize,

    /// Seed for the rejection sampler; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            seed: None,
        }
    }
}

impl SpeculativeConfig {
    /// Create a config with the default K.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Seed the rejection sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
