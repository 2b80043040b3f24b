//! # Recovery Handler
//!
//! When a write against a previously Ready key fails because the remote
//! reports the target missing (deleted out-of-band), the key's cached state
//! is invalidated so the next `ensure_ready` re-provisions only what is
//! actually gone. Attempts are budgeted per key over a sliding window: the
//! core never sees the caller's writes directly, so rapid invalidation loops
//! exhaust the budget while widely spaced legitimate recoveries do not. A
//! successful re-provision clears the key's budget.

use dashmap::DashMap;
use std::time::Instant;
use tracing::debug;

use crate::config::RecoveryConfig;
use crate::error::{ProvisionError, Result};
use crate::key::ResourceKey;

/// Classification of a write failure reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// The remote reported the write target (or its alias) missing.
    TargetMissing,
    /// Any other write failure; not recoverable by re-provisioning.
    Other,
}

/// What the caller should do after reporting a write error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAdvice {
    /// Cached state was invalidated; retry the write, which re-enters
    /// `ensure_ready`.
    Retry,
    /// Re-provisioning will not help; the caller decides disposition.
    NotRecoverable,
}

#[derive(Debug)]
struct RecoveryRecord {
    attempts: u32,
    window_start: Instant,
}

/// Windowed per-key recovery budget.
#[derive(Debug)]
pub struct RecoveryHandler {
    config: RecoveryConfig,
    records: DashMap<ResourceKey, RecoveryRecord>,
}

impl RecoveryHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Count one write-error-driven invalidation against the key's budget.
    /// Returns the attempt number, or `RecoveryExhausted` once the budget for
    /// the current window is spent.
    pub fn register_write_error(&self, key: &ResourceKey) -> Result<u32> {
        let mut record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| RecoveryRecord {
                attempts: 0,
                window_start: Instant::now(),
            });

        if record.window_start.elapsed() > self.config.window() {
            record.attempts = 0;
            record.window_start = Instant::now();
        }
        record.attempts += 1;

        if record.attempts > self.config.max_attempts {
            return Err(ProvisionError::RecoveryExhausted {
                key: key.to_string(),
                attempts: record.attempts,
            });
        }
        debug!(
            key = %key,
            attempt = record.attempts,
            max_attempts = self.config.max_attempts,
            "Recovery attempt registered"
        );
        Ok(record.attempts)
    }

    /// A successful re-provision settles the key; drop its budget record so
    /// later legitimate recoveries start from a fresh budget.
    pub fn mark_recovered(&self, key: &ResourceKey) {
        if self.records.remove(key).is_some() {
            debug!(key = %key, "Recovery budget cleared after successful re-provision");
        }
    }

    /// Forget the key's budget, e.g. when its whole epoch is torn down.
    pub fn forget(&self, key: &ResourceKey) {
        self.records.remove(key);
    }

    /// Number of keys with recovery activity in flight.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(raw: &str) -> ResourceKey {
        ResourceKey::normalize(raw, &crate::config::NamingConfig::default()).unwrap()
    }

    fn handler(max_attempts: u32) -> RecoveryHandler {
        RecoveryHandler::new(RecoveryConfig {
            max_attempts,
            window_seconds: 60,
        })
    }

    #[test]
    fn budget_allows_bounded_attempts() {
        let handler = handler(2);
        let k = key("web");
        assert_eq!(handler.register_write_error(&k).unwrap(), 1);
        assert_eq!(handler.register_write_error(&k).unwrap(), 2);
        assert!(matches!(
            handler.register_write_error(&k),
            Err(ProvisionError::RecoveryExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn window_expiry_refills_the_budget() {
        let handler = handler(1);
        let k = key("web");
        handler.register_write_error(&k).unwrap();
        assert!(handler.register_write_error(&k).is_err());

        handler.records.get_mut(&k).unwrap().window_start =
            Instant::now() - Duration::from_secs(120);
        assert_eq!(handler.register_write_error(&k).unwrap(), 1);
    }

    #[test]
    fn successful_recovery_resets_the_budget() {
        let handler = handler(2);
        let k = key("web");
        handler.register_write_error(&k).unwrap();
        handler.register_write_error(&k).unwrap();
        handler.mark_recovered(&k);
        // The next streak starts fresh instead of exhausting.
        assert_eq!(handler.register_write_error(&k).unwrap(), 1);
    }

    #[test]
    fn budgets_are_per_key() {
        let handler = handler(1);
        handler.register_write_error(&key("a")).unwrap();
        handler.register_write_error(&key("b")).unwrap();
        assert!(handler.register_write_error(&key("a")).is_err());
        assert_eq!(handler.tracked_keys(), 2);
    }

    #[test]
    fn forget_clears_the_record() {
        let handler = handler(1);
        let k = key("web");
        handler.register_write_error(&k).unwrap();
        handler.forget(&k);
        assert_eq!(handler.register_write_error(&k).unwrap(), 1);
    }
}
