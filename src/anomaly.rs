//! # Anomaly Guard
//!
//! Detects per-key provisioning failure streaks and breaks retry loops. A key
//! failing repeatedly within a bounded window gets exactly one forced cache
//! reset; if the attempt after the reset also fails, further attempts for the
//! key are fatal instead of retried indefinitely. The guard exists to stop
//! retry storms against persistently broken or adversarial remote state.

use dashmap::DashMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::AnomalyConfig;
use crate::key::ResourceKey;

/// What the caller must do after recording a provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Below threshold; the key may be retried normally.
    Retryable,
    /// Threshold crossed: the caller must fully reset the key's cache state
    /// (KeyState and existence entries). Exactly one further attempt is
    /// allowed.
    ResetForced,
    /// The post-reset attempt failed too; surface a fatal error for this key.
    Fatal,
}

#[derive(Debug)]
struct FailureRecord {
    failures: u32,
    window_start: Instant,
    tripped: bool,
}

impl FailureRecord {
    fn new() -> Self {
        Self {
            failures: 0,
            window_start: Instant::now(),
            tripped: false,
        }
    }
}

/// Windowed per-key failure tracking with a single forced-reset escalation.
#[derive(Debug)]
pub struct AnomalyGuard {
    config: AnomalyConfig,
    records: DashMap<ResourceKey, FailureRecord>,
}

impl AnomalyGuard {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Record one failed provisioning attempt for `key` and decide how the
    /// caller must proceed.
    pub fn record_failure(&self, key: &ResourceKey) -> FailureDisposition {
        let mut record = self
            .records
            .entry(key.clone())
            .or_insert_with(FailureRecord::new);

        if record.tripped {
            // The one allowed post-reset attempt has failed.
            record.failures += 1;
            return FailureDisposition::Fatal;
        }

        if record.window_start.elapsed() > self.config.window() {
            record.failures = 0;
            record.window_start = Instant::now();
        }
        record.failures += 1;

        if record.failures > self.config.failure_threshold {
            record.tripped = true;
            warn!(
                key = %key,
                failure_count = record.failures,
                threshold = self.config.failure_threshold,
                "Anomaly detected: forcing cache reset for key"
            );
            FailureDisposition::ResetForced
        } else {
            debug!(
                key = %key,
                failure_count = record.failures,
                "Provisioning failure recorded"
            );
            FailureDisposition::Retryable
        }
    }

    /// A successful provisioning attempt clears the key's streak entirely.
    pub fn record_success(&self, key: &ResourceKey) {
        if self.records.remove(key).is_some() {
            debug!(key = %key, "Failure streak cleared after success");
        }
    }

    /// Forget the key's record, e.g. when the key's cache state is
    /// invalidated for a new epoch.
    pub fn forget(&self, key: &ResourceKey) {
        self.records.remove(key);
    }

    /// Current failure count for diagnostics.
    pub fn failure_count(&self, key: &ResourceKey) -> u32 {
        self.records.get(key).map_or(0, |r| r.failures)
    }

    /// Number of keys with an active failure record.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}
