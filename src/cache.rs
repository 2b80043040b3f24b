//! # Provisioning Cache
//!
//! The singleflight controller. For each key, at most one provisioning
//! sequence runs at a time: the first caller claims the initialization and
//! runs the remote sequence; concurrent callers await a per-key completion
//! signal (a `watch` channel, no busy polling) with a bounded timeout. Once a
//! key is Ready, callers return on an in-memory fast path and only the
//! amortized per-period rollover check may touch the remote.
//!
//! No lock is held across remote I/O: the per-key mutex guards in-memory
//! transitions only, and readiness is published strictly after the remote
//! calls return.

use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::anomaly::{AnomalyGuard, FailureDisposition};
use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, Result};
use crate::key::{parse_write_target, ResourceKey, ResourceNames};
use crate::provisioner::ResourceProvisioner;
use crate::recovery::{RecoveryAdvice, RecoveryHandler, WriteErrorKind};
use crate::remote::RemoteApi;
use crate::rollover::{Clock, RolloverTracker, SystemClock};

/// Lifecycle of a key's cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyStatus {
    NotStarted,
    Initializing,
    Ready,
    Failed,
}

/// Per-key state, exclusively owned by the cache.
#[derive(Debug, Clone)]
pub struct KeyState {
    pub status: KeyStatus,
    pub last_rollover_period: Option<NaiveDate>,
    pub failure_count: u32,
    pub resource_names: ResourceNames,
    pub write_target: Option<String>,
    /// Set when the anomaly guard declared the key fatal; cleared only by a
    /// full invalidation.
    fatal: bool,
}

impl KeyState {
    fn new(resource_names: ResourceNames) -> Self {
        Self {
            status: KeyStatus::NotStarted,
            last_rollover_period: None,
            failure_count: 0,
            resource_names,
            write_target: None,
            fatal: false,
        }
    }
}

struct KeyEntry {
    state: Mutex<KeyState>,
    status_tx: watch::Sender<KeyStatus>,
}

impl KeyEntry {
    fn new(names: ResourceNames) -> Self {
        let (status_tx, _) = watch::channel(KeyStatus::NotStarted);
        Self {
            state: Mutex::new(KeyState::new(names)),
            status_tx,
        }
    }
}

/// Read-only per-key snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub status: KeyStatus,
    pub last_rollover_period: Option<NaiveDate>,
    pub failure_count: u32,
    pub write_target: Option<String>,
}

/// Read-only cache-wide counters for observability.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub tracked_keys: usize,
    pub ready_keys: usize,
    pub initializing_keys: usize,
    pub failed_keys: usize,
    pub existence_entries: usize,
    pub period_markers: usize,
    pub keys_with_failures: usize,
    pub keys_in_recovery: usize,
}

enum Claim {
    FastPath,
    Won,
    Wait(watch::Receiver<KeyStatus>),
    Fatal(u32),
}

/// Singleflight provisioning cache over a remote storage system.
pub struct ProvisioningCache {
    config: ProvisionerConfig,
    entries: DashMap<ResourceKey, Arc<KeyEntry>>,
    provisioner: ResourceProvisioner,
    rollover: RolloverTracker,
    anomaly: AnomalyGuard,
    recovery: RecoveryHandler,
    clock: Arc<dyn Clock>,
}

impl ProvisioningCache {
    /// Build a cache over `remote` using the UTC wall clock.
    pub fn new(remote: Arc<dyn RemoteApi>, config: ProvisionerConfig) -> Result<Self> {
        Self::with_clock(remote, config, Arc::new(SystemClock))
    }

    /// Build a cache with an injected clock (tests, replay).
    pub fn with_clock(
        remote: Arc<dyn RemoteApi>,
        config: ProvisionerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provisioner: ResourceProvisioner::new(remote.clone(), config.backoff.clone()),
            rollover: RolloverTracker::new(remote, clock.clone()),
            anomaly: AnomalyGuard::new(config.anomaly.clone()),
            recovery: RecoveryHandler::new(config.recovery.clone()),
            entries: DashMap::new(),
            clock,
            config,
        })
    }

    /// Guarantee the key's remote resources exist before the caller writes.
    ///
    /// Returns the normalized key on success; the caller must not write data
    /// for the key until this has returned `Ok`.
    pub async fn ensure_ready(&self, raw_key: &str) -> Result<ResourceKey> {
        let key = ResourceKey::normalize(raw_key, &self.config.naming)?;
        let names = ResourceNames::derive(&key, &self.config.naming)?;

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyEntry::new(names.clone())))
            .clone();

        let claim = {
            let mut state = entry.state.lock();
            match state.status {
                KeyStatus::Ready => Claim::FastPath,
                KeyStatus::Initializing => Claim::Wait(entry.status_tx.subscribe()),
                KeyStatus::Failed if state.fatal => Claim::Fatal(state.failure_count),
                KeyStatus::NotStarted | KeyStatus::Failed => {
                    state.status = KeyStatus::Initializing;
                    entry.status_tx.send_replace(KeyStatus::Initializing);
                    Claim::Won
                }
            }
        };

        match claim {
            Claim::FastPath => {
                // A stale rollover check must not fail the write path; the
                // previous target stays writable and the unset marker retries
                // the check on the next event.
                if let Err(error) = self.refresh_rollover(&key, &names, &entry).await {
                    warn!(key = %key, error = %error, "Rollover check failed on fast path");
                }
                Ok(key)
            }
            Claim::Won => {
                self.initialize(&key, &names, &entry).await?;
                Ok(key)
            }
            Claim::Wait(rx) => self.await_owner(&key, rx).await,
            Claim::Fatal(failure_count) => Err(ProvisionError::AnomalyDetected {
                key: key.to_string(),
                failure_count,
            }),
        }
    }

    /// Explicit rollover check for the key, surfacing errors (unlike the
    /// best-effort check on the `ensure_ready` fast path).
    ///
    /// An untracked key is provisioned first, so the rollover check never
    /// creates a target ahead of its policy and template.
    pub async fn check_rollover(&self, raw_key: &str) -> Result<()> {
        let key = ResourceKey::normalize(raw_key, &self.config.naming)?;
        let names = ResourceNames::derive(&key, &self.config.naming)?;
        if self.entries.get(&key).is_none() {
            self.ensure_ready(raw_key).await?;
        }
        match self.entries.get(&key).map(|e| e.clone()) {
            Some(entry) => self.refresh_rollover(&key, &names, &entry).await,
            // Invalidated between the ensure and the check; the next
            // ensure_ready re-provisions with today's target.
            None => Ok(()),
        }
    }

    /// Report a failed write for a previously Ready key. On a missing-target
    /// error the key's cached state is fully invalidated (budget permitting)
    /// and the caller should retry the write, which re-enters `ensure_ready`.
    pub fn on_write_error(&self, raw_key: &str, kind: WriteErrorKind) -> Result<RecoveryAdvice> {
        let key = ResourceKey::normalize(raw_key, &self.config.naming)?;
        match kind {
            WriteErrorKind::TargetMissing => {
                let attempt = self.recovery.register_write_error(&key)?;
                warn!(
                    key = %key,
                    attempt = attempt,
                    "Write target reported missing, invalidating cached state"
                );
                self.invalidate(&key);
                Ok(RecoveryAdvice::Retry)
            }
            WriteErrorKind::Other => Ok(RecoveryAdvice::NotRecoverable),
        }
    }

    /// Clear every trace of the key: its state entry, its existence-cache
    /// entries, its period marker, and its failure streak. Other keys are
    /// unaffected. Waiting claim losers observe a failed epoch.
    pub fn invalidate(&self, key: &ResourceKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            let names = entry.state.lock().resource_names.clone();
            entry.status_tx.send_replace(KeyStatus::Failed);
            self.provisioner.invalidate_names(&names);
        } else if let Ok(names) = ResourceNames::derive(key, &self.config.naming) {
            self.provisioner.invalidate_names(&names);
        }
        self.rollover.forget(key);
        self.anomaly.forget(key);
        info!(key = %key, "Key state invalidated");
    }

    /// Per-key snapshot for observability; `None` for untracked keys.
    pub fn key_status(&self, raw_key: &str) -> Option<KeySnapshot> {
        let key = ResourceKey::normalize(raw_key, &self.config.naming).ok()?;
        let entry = self.entries.get(&key)?;
        let state = entry.state.lock();
        Some(KeySnapshot {
            status: state.status,
            last_rollover_period: state.last_rollover_period,
            failure_count: state.failure_count,
            write_target: state.write_target.clone(),
        })
    }

    /// Cache-wide counters for observability.
    pub fn stats(&self) -> CacheStats {
        let mut ready = 0;
        let mut initializing = 0;
        let mut failed = 0;
        for entry in self.entries.iter() {
            match entry.value().state.lock().status {
                KeyStatus::Ready => ready += 1,
                KeyStatus::Initializing => initializing += 1,
                KeyStatus::Failed => failed += 1,
                KeyStatus::NotStarted => {}
            }
        }
        CacheStats {
            tracked_keys: self.entries.len(),
            ready_keys: ready,
            initializing_keys: initializing,
            failed_keys: failed,
            existence_entries: self.provisioner.existence_entries(),
            period_markers: self.rollover.marker_count(),
            keys_with_failures: self.anomaly.tracked_keys(),
            keys_in_recovery: self.recovery.tracked_keys(),
        }
    }

    /// Run the provisioning sequence as the claim winner and publish the
    /// outcome to all waiters.
    async fn initialize(
        &self,
        key: &ResourceKey,
        names: &ResourceNames,
        entry: &Arc<KeyEntry>,
    ) -> Result<()> {
        let today = self.clock.today();
        info!(key = %key, "Provisioning lifecycle resources");

        match self.provisioner.provision(key, names, today).await {
            Ok(target) => {
                self.anomaly.record_success(key);
                self.recovery.mark_recovered(key);
                // Provisioning may have found an existing target from an
                // earlier period; only a target born today counts as
                // verified, so a stale one still rolls over on the next
                // fast-path check.
                let target_period = parse_write_target(&target).map(|(period, _)| period);
                if target_period == Some(today) {
                    self.rollover.mark_verified(key, today);
                }
                {
                    let mut state = entry.state.lock();
                    state.status = KeyStatus::Ready;
                    state.failure_count = 0;
                    state.fatal = false;
                    state.last_rollover_period = target_period;
                    state.write_target = Some(target.clone());
                }
                entry.status_tx.send_replace(KeyStatus::Ready);
                info!(key = %key, write_target = %target, "Key ready");
                Ok(())
            }
            Err(error) => match self.anomaly.record_failure(key) {
                FailureDisposition::Retryable => {
                    {
                        let mut state = entry.state.lock();
                        state.status = KeyStatus::Failed;
                        state.failure_count += 1;
                    }
                    entry.status_tx.send_replace(KeyStatus::Failed);
                    Err(error)
                }
                FailureDisposition::ResetForced => {
                    entry.status_tx.send_replace(KeyStatus::Failed);
                    // Full clear, not a partial patch: the next attempt for
                    // this key starts from a fresh epoch with fresh existence
                    // checks. The guard remembers the trip.
                    self.clear_epoch(key, names);
                    Err(error)
                }
                FailureDisposition::Fatal => {
                    let failure_count;
                    {
                        let mut state = entry.state.lock();
                        state.status = KeyStatus::Failed;
                        state.failure_count += 1;
                        state.fatal = true;
                        failure_count = state.failure_count;
                    }
                    entry.status_tx.send_replace(KeyStatus::Failed);
                    Err(ProvisionError::AnomalyDetected {
                        key: key.to_string(),
                        failure_count,
                    })
                }
            },
        }
    }

    /// Await the in-flight owner's outcome with a bounded timeout.
    async fn await_owner(
        &self,
        key: &ResourceKey,
        mut rx: watch::Receiver<KeyStatus>,
    ) -> Result<ResourceKey> {
        let timeout = self.config.init_wait_timeout();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match *rx.borrow_and_update() {
                    KeyStatus::Ready => return Ok(()),
                    KeyStatus::Failed => {
                        return Err(ProvisionError::InitializationFailed {
                            key: key.to_string(),
                        })
                    }
                    KeyStatus::NotStarted | KeyStatus::Initializing => {}
                }
                if rx.changed().await.is_err() {
                    // Owner's entry was torn down mid-flight.
                    return Err(ProvisionError::InitializationFailed {
                        key: key.to_string(),
                    });
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(key.clone()),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ProvisionError::InitializationTimeout {
                key: key.to_string(),
                waited: timeout,
            }),
        }
    }

    async fn refresh_rollover(
        &self,
        key: &ResourceKey,
        names: &ResourceNames,
        entry: &Arc<KeyEntry>,
    ) -> Result<()> {
        if let Some(new_target) = self.rollover.check_rollover(key, names).await? {
            let mut state = entry.state.lock();
            state.write_target = Some(new_target);
            state.last_rollover_period = Some(self.clock.today());
        }
        Ok(())
    }

    /// Tear down the key's epoch after a forced anomaly reset; the anomaly
    /// record itself survives so the one post-reset attempt is enforced.
    fn clear_epoch(&self, key: &ResourceKey, names: &ResourceNames) {
        self.entries.remove(key);
        self.provisioner.invalidate_names(names);
        self.rollover.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnomalyConfig, BackoffConfig, NamingConfig};
    use crate::testing::{FixedClock, MockRemote};
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn config() -> ProvisionerConfig {
        ProvisionerConfig {
            init_wait_timeout_seconds: 1,
            backoff: BackoffConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                backoff_multiplier: 1.0,
                max_delay_ms: 2,
                jitter_enabled: false,
                jitter_max_percentage: 0.0,
            },
            ..Default::default()
        }
    }

    fn cache_at(remote: Arc<MockRemote>, date: &str) -> ProvisioningCache {
        ProvisioningCache::with_clock(remote, config(), Arc::new(FixedClock::at(date))).unwrap()
    }

    #[tokio::test]
    async fn first_caller_provisions_and_later_callers_are_free() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote.clone(), "2025-11-20");

        let key = tokio_test::assert_ok!(cache.ensure_ready("nginx").await);
        assert_eq!(key.as_str(), "nginx");
        let counts = remote.counts();

        tokio_test::assert_ok!(cache.ensure_ready("nginx").await);
        tokio_test::assert_ok!(cache.ensure_ready("nginx").await);
        assert_eq!(remote.counts(), counts);
    }

    #[tokio::test]
    async fn invalid_keys_never_reach_the_remote() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote.clone(), "2025-11-20");

        let err = cache.ensure_ready("///").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ValidationError(_)));
        assert_eq!(remote.counts(), Default::default());
        assert_eq!(cache.stats().tracked_keys, 0);
    }

    #[tokio::test]
    async fn failed_epoch_can_be_reclaimed() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote.clone(), "2025-11-20");

        remote.set_unavailable(true);
        let err = cache.ensure_ready("nginx").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ProvisioningFailed { .. }));
        assert_eq!(cache.key_status("nginx").unwrap().status, KeyStatus::Failed);

        remote.set_unavailable(false);
        tokio_test::assert_ok!(cache.ensure_ready("nginx").await);
        assert_eq!(cache.key_status("nginx").unwrap().status, KeyStatus::Ready);
    }

    #[tokio::test]
    async fn waiters_time_out_with_a_retryable_error() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote, "2025-11-20");

        // Pin a key in Initializing without an owner making progress.
        let naming = NamingConfig::default();
        let key = ResourceKey::normalize("stuck", &naming).unwrap();
        let names = ResourceNames::derive(&key, &naming).unwrap();
        let entry = Arc::new(KeyEntry::new(names));
        entry.state.lock().status = KeyStatus::Initializing;
        entry.status_tx.send_replace(KeyStatus::Initializing);
        cache.entries.insert(key, entry);

        let start = std::time::Instant::now();
        let err = cache.ensure_ready("stuck").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InitializationTimeout { .. }));
        assert!(err.is_retryable());
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn anomaly_reset_fires_once_then_key_goes_fatal() {
        let remote = Arc::new(MockRemote::new());
        let mut cfg = config();
        cfg.anomaly = AnomalyConfig {
            failure_threshold: 3,
            window_seconds: 300,
        };
        let cache =
            ProvisioningCache::with_clock(remote.clone(), cfg, Arc::new(FixedClock::at("2025-11-20")))
                .unwrap();

        remote.set_unavailable(true);
        for _ in 0..3 {
            let err = cache.ensure_ready("nginx").await.unwrap_err();
            assert!(matches!(err, ProvisionError::ProvisioningFailed { .. }));
        }
        // Failure 4 crosses the threshold: forced reset, entry cleared.
        let err = cache.ensure_ready("nginx").await.unwrap_err();
        assert!(matches!(err, ProvisionError::ProvisioningFailed { .. }));
        assert!(cache.key_status("nginx").is_none());

        // The one post-reset attempt fails too: terminal for this key.
        let err = cache.ensure_ready("nginx").await.unwrap_err();
        assert!(matches!(err, ProvisionError::AnomalyDetected { .. }));

        // Later calls fail fast without remote traffic.
        let counts = remote.counts();
        let err = cache.ensure_ready("nginx").await.unwrap_err();
        assert!(matches!(err, ProvisionError::AnomalyDetected { .. }));
        assert_eq!(remote.counts(), counts);
    }

    #[tokio::test]
    async fn anomaly_reset_allows_a_successful_recovery() {
        let remote = Arc::new(MockRemote::new());
        let mut cfg = config();
        cfg.anomaly = AnomalyConfig {
            failure_threshold: 2,
            window_seconds: 300,
        };
        let cache =
            ProvisioningCache::with_clock(remote.clone(), cfg, Arc::new(FixedClock::at("2025-11-20")))
                .unwrap();

        remote.set_unavailable(true);
        for _ in 0..3 {
            let _ = cache.ensure_ready("nginx").await.unwrap_err();
        }
        // Remote heals; the single post-reset attempt succeeds.
        remote.set_unavailable(false);
        cache.ensure_ready("nginx").await.unwrap();
        assert_eq!(cache.key_status("nginx").unwrap().status, KeyStatus::Ready);
    }

    #[tokio::test]
    async fn other_write_errors_are_not_recoverable() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote, "2025-11-20");
        cache.ensure_ready("nginx").await.unwrap();

        let advice = cache
            .on_write_error("nginx", WriteErrorKind::Other)
            .unwrap();
        assert_eq!(advice, RecoveryAdvice::NotRecoverable);
        // State untouched.
        assert_eq!(cache.key_status("nginx").unwrap().status, KeyStatus::Ready);
    }

    #[tokio::test]
    async fn stats_reflect_cache_contents() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote.clone(), "2025-11-20");
        cache.ensure_ready("nginx").await.unwrap();
        cache.ensure_ready("redis").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.tracked_keys, 2);
        assert_eq!(stats.ready_keys, 2);
        assert_eq!(stats.existence_entries, 6);
        assert_eq!(stats.period_markers, 2);
        assert_eq!(stats.keys_in_recovery, 0);
    }

    #[tokio::test]
    async fn snapshot_exposes_write_target_and_period() {
        let remote = Arc::new(MockRemote::new());
        let cache = cache_at(remote, "2025-11-20");
        cache.ensure_ready("nginx").await.unwrap();

        let snapshot = cache.key_status("nginx").unwrap();
        assert_eq!(snapshot.status, KeyStatus::Ready);
        assert_eq!(
            snapshot.write_target.as_deref(),
            Some("nginx-2025.11.20-000001")
        );
        assert_eq!(
            snapshot.last_rollover_period,
            NaiveDate::from_ymd_opt(2025, 11, 20)
        );
    }
}
