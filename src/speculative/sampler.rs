//! Modified rejection sampling for speculative decoding.
//!
//! ## Algorithm
//!
//! For each draft token `x_i` with draft probability `q(x_i)` and target
//! probability `p(x_i)`:
//!
//! ```text
//! accept with probability  α = min(1, p(x_i) / q(x_i))
//!
//! on the first rejection:  sample x' ~ norm(max(0, p - q))   and stop
//! if all K are accepted:   sample a bonus token from p at position K+1
//! ```
//!
//! The emitted tokens are distributed exactly as if they had been sampled
//! from the target distribution alone.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Outcome of verifying one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Accepted prefix of the draft.
    pub accepted: Vec<u32>,
    /// Replacement token on rejection, bonus token when everything was accepted.
    pub final_token: u32,
}

impl Verification {
    pub fn num_accepted(&self) -> usize {
        self.accepted.len()
    }

    /// Every token to commit, in order.
    pub fn emitted(&self) -> Vec<u32> {
        let mut tokens = self.accepted.clone();
        tokens.push(self.final_token);
        tokens
    }
}

/// Rejection sampler for draft verification.
#[derive(Debug)]
pub struct RejectionSampler {
    rng: StdRng,
}

impl Default for RejectionSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionSampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sampler with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Verify draft tokens against the target distributions.
    ///
    /// # Arguments
    ///
    /// * `draft_tokens` - K proposed tokens
    /// * `draft_probs` - K draft distributions, one per proposed token
    /// * `target_probs` - K+1 target distributions; row `i` is the target's
    ///   distribution for the position of `draft_tokens[i]`, the last row is
    ///   for the bonus position
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDistribution`] if the shapes disagree or a
    /// distribution cannot be sampled from.
    pub fn verify(
        &mut self,
        draft_tokens: &[u32],
        draft_probs: &[Vec<f32>],
        target_probs: &[Vec<f32>],
    ) -> Result<Verification> {
        let k = draft_tokens.len();
        if draft_probs.len() != k {
            return Err(Error::InvalidDistribution(format!(
                "{} draft distributions for {k} draft tokens",
                draft_probs.len()
            )));
        }
        if target_probs.len() != k + 1 {
            return Err(Error::InvalidDistribution(format!(
                "expected {} target distributions, got {}",
                k + 1,
                target_probs.len()
            )));
        }

        let mut accepted = Vec::with_capacity(k);
        for (i, &token) in draft_tokens.iter().enumerate() {
            let p = &target_probs[i];
            let q = &draft_probs[i];
            if p.len() != q.len() {
                return Err(Error::InvalidDistribution(format!(
                    "vocab mismatch at position {i}: target {} vs draft {}",
                    p.len(),
                    q.len()
                )));
            }
            let idx = token as usize;
            let (p_tok, q_tok) = match (p.get(idx), q.get(idx)) {
                (Some(&p_tok), Some(&q_tok)) => (p_tok, q_tok),
                _ => {
                    return Err(Error::InvalidDistribution(format!(
                        "draft token {token} outside vocabulary of {}",
                        p.len()
                    )))
                }
            };

            // A draft token the draft itself gave no mass can only be accepted
            // if the target assigns it mass.
            let alpha = if q_tok > 0.0 {
                (p_tok / q_tok).min(1.0)
            } else if p_tok > 0.0 {
                1.0
            } else {
                0.0
            };

            if self.rng.gen::<f32>() < alpha {
                accepted.push(token);
                continue;
            }

            let final_token = self.sample_residual(p, q)?;
            return Ok(Verification {
                accepted,
                final_token,
            });
        }

        let final_token = self.sample(&target_probs[k])?;
        Ok(Verification {
            accepted,
            final_token,
        })
    }

    /// Sample from `norm(max(0, p - q))`, falling back to `p` when the
    /// residual has no mass.
    fn sample_residual(&mut self, p: &[f32], q: &[f32]) -> Result<u32> {
        let residual: Vec<f32> = p.iter().zip(q).map(|(&p, &q)| (p - q).max(0.0)).collect();
        if residual.iter().sum::<f32>() > 0.0 {
            self.sample(&residual)
        } else {
            self.sample(p)
        }
    }

    /// Sample a token index from unnormalized weights.
    pub fn sample(&mut self, weights: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(weights)
            .map_err(|e| Error::InvalidDistribution(e.to_string()))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(vocab: usize, idx: usize) -> Vec<f32> {
        let mut v = vec![0.0; vocab];
        v[idx] = 1.0;
        v
    }

    #[test]
    fn test_identical_distributions_accept_everything() {
        let mut sampler = RejectionSampler::with_seed(7);
        let uniform = vec![0.25f32; 4];
        let result = sampler
            .verify(&[0, 1, 2], &vec![uniform.clone(); 3], &vec![uniform; 4])
            .unwrap();
        assert_eq!(result.num_accepted(), 3);
        assert!(result.final_token < 4);
    }

    #[test]
    fn test_zero_target_mass_rejects_and_replaces() {
        let mut sampler = RejectionSampler::with_seed(7);
        let result = sampler
            .verify(&[1], &[one_hot(4, 1)], &[one_hot(4, 3), one_hot(4, 0)])
            .unwrap();
        assert!(result.accepted.is_empty());
        assert_eq!(result.final_token, 3);
        assert_eq!(result.emitted(), vec![3]);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let mut sampler = RejectionSampler::new();
        let uniform = vec![0.5f32; 2];
        let err = sampler
            .verify(&[0, 1], &vec![uniform.clone(); 2], &vec![uniform; 2])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDistribution(_)));
    }

    #[test]
    fn test_out_of_vocab_token_is_an_error() {
        let mut sampler = RejectionSampler::new();
        let uniform = vec![0.5f32; 2];
        assert!(sampler
            .verify(&[5], &[uniform.clone()], &[uniform.clone(), uniform])
            .is_err());
    }
}
