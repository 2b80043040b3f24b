//! # Test Support
//!
//! An in-memory [`RemoteApi`] with call counters and failure injection, plus
//! a fixed clock. Used by this crate's unit and integration tests; exported
//! so host pipelines can exercise their glue against the same mock.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::remote::{RemoteApi, RemoteError, RemoteResult};
use crate::rollover::Clock;

/// Snapshot of per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub exists_policy: u32,
    pub create_policy: u32,
    pub exists_template: u32,
    pub create_template: u32,
    pub exists_alias: u32,
    pub get_write_target: u32,
    pub create_target: u32,
    pub repoint_alias: u32,
}

#[derive(Debug, Clone)]
struct MockTarget {
    alias: String,
    is_write_target: bool,
    policy: String,
}

/// In-memory remote with conflict-on-duplicate semantics and injectable
/// transient failures.
#[derive(Default)]
pub struct MockRemote {
    policies: DashMap<String, Value>,
    templates: DashMap<String, Value>,
    targets: DashMap<String, MockTarget>,
    counts: Mutex<CallCounts>,
    fail_creates: AtomicU32,
    conflict_creates: AtomicU32,
    fail_repoints: AtomicU32,
    unavailable: AtomicBool,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> CallCounts {
        *self.counts.lock()
    }

    /// The next `n` create calls (any kind) fail with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// The next `n` create calls (any kind) return a conflict.
    pub fn conflict_next_creates(&self, n: u32) {
        self.conflict_creates.store(n, Ordering::SeqCst);
    }

    /// The next `n` repoint calls fail with a transient error.
    pub fn fail_next_repoints(&self, n: u32) {
        self.fail_repoints.store(n, Ordering::SeqCst);
    }

    /// While set, every operation fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn seed_policy(&self, name: &str) {
        self.policies.insert(name.to_string(), Value::Null);
    }

    pub fn seed_template(&self, name: &str) {
        self.templates.insert(name.to_string(), Value::Null);
    }

    pub fn seed_target(&self, name: &str, alias: &str, is_write_target: bool, policy: &str) {
        self.targets.insert(
            name.to_string(),
            MockTarget {
                alias: alias.to_string(),
                is_write_target,
                policy: policy.to_string(),
            },
        );
    }

    /// Simulate out-of-band deletion of a target.
    pub fn delete_target(&self, name: &str) {
        self.targets.remove(name);
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// The single target carrying the write flag for `alias`, if any.
    pub fn write_target_of(&self, alias: &str) -> Option<String> {
        self.targets
            .iter()
            .find(|t| t.value().alias == alias && t.value().is_write_target)
            .map(|t| t.key().clone())
    }

    /// Lifecycle policy a target was created with.
    pub fn policy_of(&self, target: &str) -> Option<String> {
        self.targets.get(target).map(|t| t.policy.clone())
    }

    /// All targets carrying the write flag for `alias`; invariant tests
    /// assert this never exceeds one.
    pub fn write_targets_of(&self, alias: &str) -> Vec<String> {
        self.targets
            .iter()
            .filter(|t| t.value().alias == alias && t.value().is_write_target)
            .map(|t| t.key().clone())
            .collect()
    }

    fn gate(&self) -> RemoteResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("remote unavailable".to_string()));
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn create_gate(&self) -> RemoteResult<()> {
        self.gate()?;
        if Self::take(&self.conflict_creates) {
            return Err(RemoteError::Conflict);
        }
        if Self::take(&self.fail_creates) {
            return Err(RemoteError::Transient("injected create failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn exists_policy(&self, name: &str) -> RemoteResult<bool> {
        self.counts.lock().exists_policy += 1;
        self.gate()?;
        Ok(self.policies.contains_key(name))
    }

    async fn create_policy(&self, name: &str, spec: &Value) -> RemoteResult<()> {
        self.counts.lock().create_policy += 1;
        self.create_gate()?;
        if self.policies.contains_key(name) {
            return Err(RemoteError::Conflict);
        }
        self.policies.insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn exists_template(&self, name: &str) -> RemoteResult<bool> {
        self.counts.lock().exists_template += 1;
        self.gate()?;
        Ok(self.templates.contains_key(name))
    }

    async fn create_template(&self, name: &str, spec: &Value) -> RemoteResult<()> {
        self.counts.lock().create_template += 1;
        self.create_gate()?;
        if self.templates.contains_key(name) {
            return Err(RemoteError::Conflict);
        }
        self.templates.insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn exists_alias(&self, name: &str) -> RemoteResult<bool> {
        self.counts.lock().exists_alias += 1;
        self.gate()?;
        Ok(self.targets.iter().any(|t| t.value().alias == name))
    }

    async fn get_write_target(&self, alias: &str) -> RemoteResult<Option<String>> {
        self.counts.lock().get_write_target += 1;
        self.gate()?;
        Ok(self.write_target_of(alias))
    }

    async fn create_target_with_alias(
        &self,
        target: &str,
        alias: &str,
        is_write_target: bool,
        policy_name: &str,
    ) -> RemoteResult<()> {
        self.counts.lock().create_target += 1;
        self.create_gate()?;
        if self.targets.contains_key(target) {
            return Err(RemoteError::Conflict);
        }
        self.targets.insert(
            target.to_string(),
            MockTarget {
                alias: alias.to_string(),
                is_write_target,
                policy: policy_name.to_string(),
            },
        );
        Ok(())
    }

    async fn repoint_alias(&self, alias: &str, from: &str, to: &str) -> RemoteResult<()> {
        self.counts.lock().repoint_alias += 1;
        self.gate()?;
        if Self::take(&self.fail_repoints) {
            return Err(RemoteError::Transient(
                "injected repoint failure".to_string(),
            ));
        }
        if !self.targets.contains_key(to) {
            return Err(RemoteError::NotFound);
        }
        if let Some(mut old) = self.targets.get_mut(from) {
            old.is_write_target = false;
        }
        let mut new = self
            .targets
            .get_mut(to)
            .ok_or(RemoteError::NotFound)?;
        new.alias = alias.to_string();
        new.is_write_target = true;
        Ok(())
    }
}

/// A clock pinned to a fixed date, settable mid-test.
#[derive(Debug)]
pub struct FixedClock {
    date: Mutex<NaiveDate>,
}

impl FixedClock {
    /// `date` in `YYYY-MM-DD` form.
    pub fn at(date: &str) -> Self {
        Self {
            date: Mutex::new(
                NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("valid YYYY-MM-DD date"),
            ),
        }
    }

    pub fn set(&self, date: &str) {
        *self.date.lock() = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("valid date");
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.date.lock()
    }
}
