//! Account selection policies
//!
//! A policy only decides *which* eligible account goes next. Eligibility
//! (health, already-tried) is decided by the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::account::Account;
use crate::config::SelectionPolicyKind;

pub trait SelectionPolicy: Send {
    fn name(&self) -> &'static str;

    /// Pick one account from `pool` for which `eligible` holds.
    fn pick(
        &mut self,
        pool: &[Arc<Account>],
        eligible: &dyn Fn(&Account) -> bool,
    ) -> Option<Arc<Account>>;
}

/// Cycles through the pool in order, skipping ineligible accounts.
#[derive(Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(
        &mut self,
        pool: &[Arc<Account>],
        eligible: &dyn Fn(&Account) -> bool,
    ) -> Option<Arc<Account>> {
        let total = pool.len();
        for offset in 0..total {
            let idx = (self.cursor + offset) % total;
            if eligible(&pool[idx]) {
                self.cursor = idx + 1;
                return Some(pool[idx].clone());
            }
        }
        None
    }
}

/// Picks the eligible account that has gone longest without traffic.
/// Never-used accounts go first, in pool order.
#[derive(Default)]
pub struct LeastRecentlyUsed {
    last_used: HashMap<String, Instant>,
}

impl SelectionPolicy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "least_recently_used"
    }

    fn pick(
        &mut self,
        pool: &[Arc<Account>],
        eligible: &dyn Fn(&Account) -> bool,
    ) -> Option<Arc<Account>> {
        let chosen = pool
            .iter()
            .filter(|a| eligible(a))
            .min_by_key(|a| self.last_used.get(&a.id).copied())?
            .clone();
        self.last_used.insert(chosen.id.clone(), Instant::now());
        // Forget accounts that left the pool.
        self.last_used
            .retain(|id, _| pool.iter().any(|a| &a.id == id));
        Some(chosen)
    }
}

pub fn policy_for(kind: SelectionPolicyKind) -> Box<dyn SelectionPolicy> {
    match kind {
        SelectionPolicyKind::RoundRobin => Box::new(RoundRobin::default()),
        SelectionPolicyKind::LeastRecentlyUsed => Box::new(LeastRecentlyUsed::default()),
    }
}
