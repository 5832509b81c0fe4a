//! Per-step scheduling budget.
//!
//! A fresh budget is created every step from the configured limits. Tokens
//! and sequences are charged per group, so charging the same group twice is
//! a no-op.

use std::collections::HashMap;

use tracing::trace;

use crate::core::sequence::GroupId;

/// Caps on the tokens and sequences processed in one step.
#[derive(Debug, Clone)]
pub struct SchedulingBudget {
    token_budget: usize,
    max_num_seqs: usize,
    /// Tokens charged per group.
    tokens_by_group: HashMap<GroupId, usize>,
    /// Sequences charged per group.
    seqs_by_group: HashMap<GroupId, usize>,
    num_batched_tokens: usize,
    num_curr_seqs: usize,
}

impl SchedulingBudget {
    pub fn new(token_budget: usize, max_num_seqs: usize) -> Self {
        Self {
            token_budget,
            max_num_seqs,
            tokens_by_group: HashMap::new(),
            seqs_by_group: HashMap::new(),
            num_batched_tokens: 0,
            num_curr_seqs: 0,
        }
    }

    /// Check whether `num_new_tokens` tokens over `num_new_seqs` more
    /// sequences still fit.
    pub fn can_schedule(&self, num_new_tokens: usize, num_new_seqs: usize) -> bool {
        self.num_batched_tokens + num_new_tokens <= self.token_budget
            && self.num_curr_seqs + num_new_seqs <= self.max_num_seqs
    }

    pub fn remaining_token_budget(&self) -> usize {
        self.token_budget.saturating_sub(self.num_batched_tokens)
    }

    pub fn remaining_seqs(&self) -> usize {
        self.max_num_seqs.saturating_sub(self.num_curr_seqs)
    }

    pub fn num_batched_tokens(&self) -> usize {
        self.num_batched_tokens
    }

    pub fn num_curr_seqs(&self) -> usize {
        self.num_curr_seqs
    }

    /// Charge a group's tokens. A group is charged at most once.
    pub fn add_num_batched_tokens(&mut self, group_id: GroupId, num_tokens: usize) {
        if self.tokens_by_group.contains_key(&group_id) {
            return;
        }
        trace!(group_id, num_tokens, "Charging tokens");
        self.tokens_by_group.insert(group_id, num_tokens);
        self.num_batched_tokens += num_tokens;
    }

    /// Charge a group's sequences. A group is charged at most once.
    pub fn add_num_seqs(&mut self, group_id: GroupId, num_seqs: usize) {
        if self.seqs_by_group.contains_key(&group_id) {
            return;
        }
        self.seqs_by_group.insert(group_id, num_seqs);
        self.num_curr_seqs += num_seqs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_limits() {
        let mut budget = SchedulingBudget::new(10, 2);
        assert!(budget.can_schedule(10, 2));
        assert!(!budget.can_schedule(11, 1));

        budget.add_num_batched_tokens(1, 6);
        budget.add_num_seqs(1, 1);
        assert!(budget.can_schedule(4, 1));
        assert!(!budget.can_schedule(5, 1));
        assert!(!budget.can_schedule(1, 2));
        assert_eq!(budget.remaining_token_budget(), 4);
        assert_eq!(budget.remaining_seqs(), 1);
    }

    #[test]
    fn test_double_charge_is_ignored() {
        let mut budget = SchedulingBudget::new(10, 4);
        budget.add_num_batched_tokens(7, 3);
        budget.add_num_batched_tokens(7, 3);
        budget.add_num_seqs(7, 2);
        budget.add_num_seqs(7, 2);
        assert_eq!(budget.num_batched_tokens(), 3);
        assert_eq!(budget.num_curr_seqs(), 2);
    }
}
