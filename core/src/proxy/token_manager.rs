//! Token Manager for managing the account pool
//!
//! The pool is an immutable snapshot swapped on reload. Selection and health
//! marking both go through one async mutex so a policy never observes a
//! half-applied failure.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::account::{load_accounts_from_dir, Account};
use crate::config::SelectionPolicyKind;
use crate::error::{GatewayError, GatewayResult};
use crate::proxy::rate_limit::CooldownTracker;
use crate::proxy::selection::{policy_for, SelectionPolicy};

pub struct TokenManager {
    accounts: ArcSwap<Vec<Arc<Account>>>,
    policy: tokio::sync::Mutex<Box<dyn SelectionPolicy>>,
    cooldowns: CooldownTracker,
    default_cooldown_secs: AtomicU64,
}

impl TokenManager {
    pub fn new(policy: SelectionPolicyKind, default_cooldown: Duration) -> Self {
        Self {
            accounts: ArcSwap::from_pointee(Vec::new()),
            policy: tokio::sync::Mutex::new(policy_for(policy)),
            cooldowns: CooldownTracker::new(),
            default_cooldown_secs: AtomicU64::new(default_cooldown.as_secs()),
        }
    }

    pub fn with_accounts(
        accounts: Vec<Account>,
        policy: SelectionPolicyKind,
        default_cooldown: Duration,
    ) -> Self {
        let manager = Self::new(policy, default_cooldown);
        manager.replace_accounts(accounts);
        manager
    }

    /// Load accounts from directory, replacing the current pool.
    pub fn load_accounts(&self, dir: &Path) -> anyhow::Result<usize> {
        let accounts = load_accounts_from_dir(dir)?;
        let count = accounts.len();
        self.replace_accounts(accounts);
        tracing::info!("Loaded {} account(s) from {:?}", count, dir);
        Ok(count)
    }

    pub fn replace_accounts(&self, accounts: Vec<Account>) {
        let pool: Vec<Arc<Account>> = accounts
            .into_iter()
            .filter(Account::is_usable)
            .map(Arc::new)
            .collect();
        self.accounts.store(Arc::new(pool));
    }

    /// Pick a healthy account not in `exclude`. Never touches the network.
    pub async fn select(&self, exclude: &HashSet<String>) -> GatewayResult<Arc<Account>> {
        let pool = self.accounts.load_full();
        if pool.is_empty() {
            return Err(GatewayError::NoAvailableAccount(
                "account pool is empty".to_string(),
            ));
        }

        let mut policy = self.policy.lock().await;
        self.cooldowns.cleanup_expired();
        let eligible = |account: &Account| {
            !exclude.contains(&account.id) && !self.cooldowns.is_cooling_down(&account.id)
        };

        if let Some(account) = policy.pick(&pool, &eligible) {
            tracing::debug!(
                "Selected account {} via {}",
                account.email,
                policy.name()
            );
            return Ok(account);
        }

        let min_wait = pool
            .iter()
            .filter_map(|a| self.cooldowns.remaining(&a.id))
            .min();
        let reason = match min_wait {
            Some(wait) if exclude.is_empty() => format!(
                "all {} account(s) are cooling down, retry in {}s",
                pool.len(),
                wait.as_secs().max(1)
            ),
            _ => format!(
                "no untried healthy account left ({} in pool)",
                pool.len()
            ),
        };
        Err(GatewayError::NoAvailableAccount(reason))
    }

    /// Record an upstream failure. Returns the applied cool-down when the
    /// status is account-specific.
    pub async fn report_failure(
        &self,
        account_id: &str,
        status: u16,
        retry_after_header: Option<&str>,
        error_body: &str,
    ) -> Option<Duration> {
        let wait = CooldownTracker::cooldown_for(
            status,
            retry_after_header,
            error_body,
            self.default_cooldown(),
        )?;
        self.mark_unhealthy(account_id, wait, &format!("HTTP {}", status))
            .await;
        Some(wait)
    }

    pub async fn mark_unhealthy(&self, account_id: &str, duration: Duration, reason: &str) {
        let _serialized = self.policy.lock().await;
        self.cooldowns.cleanup_expired();
        self.cooldowns.mark(account_id, duration, reason);
        tracing::warn!(
            "Account {} cooling down for {}s ({})",
            account_id,
            duration.as_secs(),
            reason
        );
    }

    /// Return an account to service before its cool-down ends.
    pub async fn revalidate(&self, account_id: &str) -> bool {
        let _serialized = self.policy.lock().await;
        self.cooldowns.clear(account_id)
    }

    pub fn is_cooling_down(&self, account_id: &str) -> bool {
        self.cooldowns.is_cooling_down(account_id)
    }

    /// Accounts currently eligible for selection. Read-only; expired
    /// entries are swept by `select` and `mark_unhealthy`.
    pub fn active_count(&self) -> usize {
        self.accounts
            .load()
            .iter()
            .filter(|a| !self.cooldowns.is_cooling_down(&a.id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.accounts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.load().is_empty()
    }

    pub async fn set_policy(&self, kind: SelectionPolicyKind) {
        let mut policy = self.policy.lock().await;
        *policy = policy_for(kind);
    }

    pub fn set_default_cooldown(&self, duration: Duration) {
        self.default_cooldown_secs
            .store(duration.as_secs(), Ordering::Relaxed);
    }

    fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs.load(Ordering::Relaxed))
    }
}
