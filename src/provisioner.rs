//! # Resource Provisioner
//!
//! Ensures the remote resources backing a key exist, in strict order: the
//! lifecycle policy first (the template references it by name), then the
//! structural template (the write target must match its pattern), then the
//! write target with its alias.
//!
//! An existence cache keyed by `(kind, name)` skips redundant remote checks;
//! a boolean is recorded only after the remote call returns, never before.
//! Conflict responses on create are treated as success so races with external
//! or concurrent creators stay idempotent.

use chrono::NaiveDate;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::constants::INITIAL_GENERATION;
use crate::error::{ProvisionError, Result};
use crate::key::{write_target_name, ResourceKey, ResourceNames};
use crate::remote::{RemoteApi, RemoteError, RemoteResult, ResourceKind};

/// Result of ensuring a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// Cache of confirmed remote existence, independent of per-key state.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    entries: DashMap<(ResourceKind, String), bool>,
}

impl ExistenceCache {
    pub fn check(&self, kind: ResourceKind, name: &str) -> Option<bool> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|known| *known)
    }

    pub fn record(&self, kind: ResourceKind, name: &str, exists: bool) {
        self.entries.insert((kind, name.to_string()), exists);
    }

    /// Drop every entry scoped to one key's derived names. Other keys are
    /// unaffected.
    pub fn invalidate(&self, names: &ResourceNames) {
        self.entries.remove(&(ResourceKind::Policy, names.policy.clone()));
        self.entries
            .remove(&(ResourceKind::Template, names.template.clone()));
        self.entries.remove(&(ResourceKind::Alias, names.alias.clone()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ensures policy, template, and write-target/alias exist for a key.
pub struct ResourceProvisioner {
    remote: Arc<dyn RemoteApi>,
    existence: ExistenceCache,
    backoff: BackoffConfig,
}

impl ResourceProvisioner {
    pub fn new(remote: Arc<dyn RemoteApi>, backoff: BackoffConfig) -> Self {
        Self {
            remote,
            existence: ExistenceCache::default(),
            backoff,
        }
    }

    /// Run the full ordered provisioning sequence for a key and return the
    /// name of the target currently carrying the write flag.
    pub async fn provision(
        &self,
        key: &ResourceKey,
        names: &ResourceNames,
        today: NaiveDate,
    ) -> Result<String> {
        self.ensure(ResourceKind::Policy, &names.policy, &policy_spec())
            .await?;
        self.ensure(ResourceKind::Template, &names.template, &template_spec(names))
            .await?;
        self.ensure_write_target(key, names, today).await
    }

    /// Ensure one resource exists, consulting the existence cache first.
    pub async fn ensure(
        &self,
        kind: ResourceKind,
        name: &str,
        spec: &Value,
    ) -> Result<EnsureOutcome> {
        if self.existence.check(kind, name) == Some(true) {
            debug!(kind = %kind, name = name, "Existence cache hit, skipping remote check");
            return Ok(EnsureOutcome::AlreadyExists);
        }

        let exists = self
            .call_with_retry(kind, name, "exists", || self.exists_raw(kind, name))
            .await
            .map_err(|e| self.map_remote(kind, name, "exists", e))?;
        self.existence.record(kind, name, exists);

        if exists {
            debug!(kind = %kind, name = name, "Resource already present on remote");
            return Ok(EnsureOutcome::AlreadyExists);
        }

        match self
            .call_with_retry(kind, name, "create", || self.create_raw(kind, name, spec))
            .await
        {
            Ok(()) => {
                self.existence.record(kind, name, true);
                info!(kind = %kind, name = name, "Created remote resource");
                Ok(EnsureOutcome::Created)
            }
            Err(RemoteError::Conflict) => {
                // Someone else created it between our exists check and the
                // create; that is success for our purposes.
                self.existence.record(kind, name, true);
                debug!(kind = %kind, name = name, "Create conflicted, resource exists");
                Ok(EnsureOutcome::AlreadyExists)
            }
            Err(e) => Err(self.map_remote(kind, name, "create", e)),
        }
    }

    /// Ensure the alias exists with a write target attached, creating today's
    /// initial-generation target when absent.
    async fn ensure_write_target(
        &self,
        key: &ResourceKey,
        names: &ResourceNames,
        today: NaiveDate,
    ) -> Result<String> {
        let alias = names.alias.as_str();

        if self.existence.check(ResourceKind::Alias, alias) != Some(true) {
            let exists = self
                .call_with_retry(ResourceKind::Alias, alias, "exists", || {
                    self.exists_raw(ResourceKind::Alias, alias)
                })
                .await
                .map_err(|e| self.map_remote(ResourceKind::Alias, alias, "exists", e))?;
            self.existence.record(ResourceKind::Alias, alias, exists);
        }

        if self.existence.check(ResourceKind::Alias, alias) == Some(true) {
            match self
                .call_with_retry(ResourceKind::Alias, alias, "get_write_target", || {
                    self.remote.get_write_target(alias)
                })
                .await
            {
                Ok(Some(target)) => return Ok(target),
                // Alias disappeared or has no write target; fall through and
                // recreate the initial target.
                Ok(None) | Err(RemoteError::NotFound) => {}
                Err(e) => {
                    return Err(self.map_remote(ResourceKind::Alias, alias, "get_write_target", e))
                }
            }
        }

        let target = write_target_name(key, today, INITIAL_GENERATION);
        match self
            .call_with_retry(ResourceKind::Alias, alias, "create_target", || {
                self.remote
                    .create_target_with_alias(&target, alias, true, &names.policy)
            })
            .await
        {
            Ok(()) => {
                self.existence.record(ResourceKind::Alias, alias, true);
                info!(
                    key = %key,
                    target = %target,
                    alias = alias,
                    policy = %names.policy,
                    "Created initial write target"
                );
                Ok(target)
            }
            Err(RemoteError::Conflict) => {
                self.existence.record(ResourceKind::Alias, alias, true);
                // Lost the creation race; the remote knows the real target.
                match self
                    .call_with_retry(ResourceKind::Alias, alias, "get_write_target", || {
                        self.remote.get_write_target(alias)
                    })
                    .await
                {
                    Ok(Some(actual)) => Ok(actual),
                    Ok(None) => {
                        // The name exists but nothing carries the write flag
                        // for the alias (demoted externally). Promote the
                        // existing target so a Ready key always has a
                        // writable target.
                        self.call_with_retry(ResourceKind::Alias, alias, "repoint_alias", || {
                            self.remote.repoint_alias(alias, &target, &target)
                        })
                        .await
                        .map_err(|e| {
                            self.map_remote(ResourceKind::Alias, alias, "repoint_alias", e)
                        })?;
                        info!(
                            key = %key,
                            target = %target,
                            "Promoted existing target to write target"
                        );
                        Ok(target)
                    }
                    Err(e) => {
                        Err(self.map_remote(ResourceKind::Alias, alias, "get_write_target", e))
                    }
                }
            }
            Err(e) => Err(self.map_remote(ResourceKind::Alias, alias, "create_target", e)),
        }
    }

    /// Drop all existence entries scoped to one key's names.
    pub fn invalidate_names(&self, names: &ResourceNames) {
        self.existence.invalidate(names);
    }

    pub fn existence_entries(&self) -> usize {
        self.existence.len()
    }

    async fn exists_raw(&self, kind: ResourceKind, name: &str) -> RemoteResult<bool> {
        let result = match kind {
            ResourceKind::Policy => self.remote.exists_policy(name).await,
            ResourceKind::Template => self.remote.exists_template(name).await,
            ResourceKind::Alias => self.remote.exists_alias(name).await,
        };
        match result {
            Err(RemoteError::NotFound) => Ok(false),
            other => other,
        }
    }

    async fn create_raw(&self, kind: ResourceKind, name: &str, spec: &Value) -> RemoteResult<()> {
        match kind {
            ResourceKind::Policy => self.remote.create_policy(name, spec).await,
            ResourceKind::Template => self.remote.create_template(name, spec).await,
            // Alias creation goes through create_target_with_alias.
            ResourceKind::Alias => Err(RemoteError::Fatal(
                "aliases are created together with their write target".to_string(),
            )),
        }
    }

    /// Retry transient failures with bounded backoff; everything else passes
    /// through to the caller untouched.
    async fn call_with_retry<T, F, Fut>(
        &self,
        kind: ResourceKind,
        name: &str,
        operation: &str,
        mut call: F,
    ) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Err(RemoteError::Transient(reason)) if attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        kind = %kind,
                        name = name,
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.backoff.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient remote failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn map_remote(
        &self,
        kind: ResourceKind,
        name: &str,
        operation: &str,
        error: RemoteError,
    ) -> ProvisionError {
        let resource = format!("{kind} {name}");
        match error {
            RemoteError::Transient(reason) => ProvisionError::ProvisioningFailed {
                resource,
                attempts: self.backoff.max_attempts,
                reason: format!("{operation} exhausted retries: {reason}"),
            },
            RemoteError::Fatal(reason) => ProvisionError::ProvisioningFailed {
                resource,
                attempts: 1,
                reason: format!("{operation} failed fatally: {reason}"),
            },
            RemoteError::NotFound => ProvisionError::ProvisioningFailed {
                resource,
                attempts: 1,
                reason: format!("{operation} reported the resource missing"),
            },
            RemoteError::Conflict => ProvisionError::ProvisioningFailed {
                resource,
                attempts: 1,
                reason: format!("{operation} conflicted unexpectedly"),
            },
        }
    }
}

/// Minimal lifecycle policy body. Retention details are the remote system's
/// concern; rollover itself is driven by this core per calendar period.
pub fn policy_spec() -> Value {
    json!({
        "policy": {
            "phases": {
                "hot": { "actions": {} },
                "delete": {
                    "min_age": "30d",
                    "actions": { "delete": {} }
                }
            }
        }
    })
}

/// Structural template binding the key's index pattern to its policy and
/// rollover alias.
pub fn template_spec(names: &ResourceNames) -> Value {
    json!({
        "index_patterns": [names.index_pattern()],
        "settings": {
            "index.lifecycle.name": names.policy,
            "index.lifecycle.rollover_alias": names.alias
        }
    })
}
