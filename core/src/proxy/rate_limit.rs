//! Account cool-down tracking
//!
//! An account that fails with an auth or quota error is parked until its
//! cool-down expires. Expiry is the revalidation point: after it the account
//! is eligible again.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, Instant};

static RETRY_DELAY_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?:"retryDelay"|"retry_delay")\s*:\s*"?(\d+)"#).ok());

/// Upstream statuses that point at the credential, not the request.
pub fn is_account_failure(status: u16) -> bool {
    matches!(status, 401 | 403 | 429)
}

pub struct CooldownTracker {
    /// account_id -> (reset_time, reason)
    limits: DashMap<String, (Instant, String)>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            limits: DashMap::new(),
        }
    }

    pub fn mark(&self, account_id: &str, duration: Duration, reason: &str) {
        let reset_time = Instant::now() + duration;
        self.limits
            .insert(account_id.to_string(), (reset_time, reason.to_string()));
    }

    /// Work out the cool-down for an upstream failure. Returns `None` when
    /// the status is not account-specific.
    pub fn cooldown_for(
        status: u16,
        retry_after_header: Option<&str>,
        error_body: &str,
        default: Duration,
    ) -> Option<Duration> {
        if !is_account_failure(status) {
            return None;
        }

        let mut wait = default;

        // Only quota responses carry a meaningful retry hint.
        if status == 429 {
            if let Some(secs) = retry_after_header.and_then(|v| v.trim().parse::<u64>().ok()) {
                wait = Duration::from_secs(secs);
            }
            if let Some(secs) = Self::parse_retry_delay(error_body) {
                wait = Duration::from_secs(secs);
            }
        }

        Some(wait)
    }

    /// Parse retryDelay from Google error response
    fn parse_retry_delay(body: &str) -> Option<u64> {
        let re = RETRY_DELAY_RE.as_ref()?;
        re.captures(body)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn is_cooling_down(&self, account_id: &str) -> bool {
        if let Some(entry) = self.limits.get(account_id) {
            if Instant::now() < entry.0 {
                return true;
            }
        }
        false
    }

    /// Remaining wait, `None` if not cooling down.
    pub fn remaining(&self, account_id: &str) -> Option<Duration> {
        self.limits.get(account_id).and_then(|entry| {
            let now = Instant::now();
            (now < entry.0).then(|| entry.0 - now)
        })
    }

    pub fn clear(&self, account_id: &str) -> bool {
        self.limits.remove(account_id).is_some()
    }

    /// Cleanup expired entries
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.limits.retain(|_, (reset_time, _)| {
            if now >= *reset_time {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}
