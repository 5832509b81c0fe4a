//! Speculative decoding.
//!
//! This module implements draft-verify speculative decoding on top of the
//! paged cache.
//!
//! ## How it works
//!
//! 1. **Draft Phase**: A cheap draft collaborator proposes K tokens for each
//!    decoding sequence. The scheduler has already reserved K lookahead slots.
//!
//! 2. **Verify Phase**: The target model processes the last confirmed token
//!    and all K drafts in a single pass, producing K+1 distributions.
//!
//! 3. **Rejection Sampling**: Each draft token is accepted or rejected based on
//!    the probability ratio between target and draft distributions.
//!
//! 4. **Reconcile**: Slots past the accepted prefix are released.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [ctx] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [last, t1, t2, t3, t4] -> distributions for 5 positions
//! Rejection:       Accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! Reconcile:       keep slots for t1, t2; release the slots of t3, t4
//! ```

pub mod config;
pub mod coordinator;
pub mod sampler;

pub use config::SpeculativeConfig;
pub use coordinator::{Reconciliation, SpecDecodeStats, SpeculativeCoordinator};
pub use sampler::{RejectionSampler, Verification};
