//! # Rollover Tracker
//!
//! Keeps each key's write target aligned with the current calendar period.
//! The strategy is purely period-based: the period date is embedded in the
//! target name and a new target is started when the date changes. The check
//! is amortized to one remote round-trip per key per period via a period
//! marker map; events within an already-verified period cost nothing.

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::constants::INITIAL_GENERATION;
use crate::error::{ProvisionError, Result};
use crate::key::{parse_write_target, write_target_name, ResourceKey, ResourceNames};
use crate::remote::{RemoteApi, RemoteError};

/// Source of the current calendar period. Injected so period boundaries are
/// testable.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall-clock periods in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Ensures the write target matches the current period, once per key per
/// period.
pub struct RolloverTracker {
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    markers: DashMap<ResourceKey, NaiveDate>,
}

impl RolloverTracker {
    pub fn new(remote: Arc<dyn RemoteApi>, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            clock,
            markers: DashMap::new(),
        }
    }

    /// Record that the key's target was verified for `period`, e.g. right
    /// after initial provisioning created today's target.
    pub fn mark_verified(&self, key: &ResourceKey, period: NaiveDate) {
        self.markers.insert(key.clone(), period);
    }

    /// Drop the key's marker so the next check consults the remote again.
    pub fn forget(&self, key: &ResourceKey) {
        self.markers.remove(key);
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Check the key's write target against today's period, rolling over if
    /// it is stale. Returns the new write target when a rollover happened.
    ///
    /// The period marker is advanced only after the repoint succeeds, so a
    /// failed rollover is retried on the next check instead of silently
    /// skipped for the rest of the period.
    pub async fn check_rollover(
        &self,
        key: &ResourceKey,
        names: &ResourceNames,
    ) -> Result<Option<String>> {
        let today = self.clock.today();
        if self.markers.get(key).map(|d| *d) == Some(today) {
            return Ok(None);
        }

        let current = match self.remote.get_write_target(&names.alias).await {
            Ok(target) => target,
            Err(RemoteError::NotFound) => None,
            Err(e) => return Err(self.map_remote(names, "get_write_target", e)),
        };

        let Some(current) = current else {
            // The alias lost its write target out-of-band; restore an
            // initial-generation target for today.
            let target = write_target_name(key, today, INITIAL_GENERATION);
            return match self
                .remote
                .create_target_with_alias(&target, &names.alias, true, &names.policy)
                .await
            {
                Ok(()) | Err(RemoteError::Conflict) => {
                    self.markers.insert(key.clone(), today);
                    info!(key = %key, target = %target, "Restored missing write target");
                    Ok(Some(target))
                }
                Err(e) => Err(self.map_remote(names, "create_target", e)),
            };
        };

        match parse_write_target(&current) {
            Some((period, _)) if period == today => {
                debug!(key = %key, target = %current, "Write target already on today's period");
                self.markers.insert(key.clone(), today);
                Ok(None)
            }
            Some((period, generation)) => {
                let next = write_target_name(key, today, generation + 1);
                match self
                    .remote
                    .create_target_with_alias(&next, &names.alias, false, &names.policy)
                    .await
                {
                    Ok(()) | Err(RemoteError::Conflict) => {}
                    Err(e) => return Err(self.map_remote(names, "create_target", e)),
                }
                match self.remote.repoint_alias(&names.alias, &current, &next).await {
                    Ok(()) => {
                        self.markers.insert(key.clone(), today);
                        info!(
                            key = %key,
                            from = %current,
                            to = %next,
                            stale_period = %period,
                            "Rolled over write target for new period"
                        );
                        Ok(Some(next))
                    }
                    Err(e) => Err(self.map_remote(names, "repoint_alias", e)),
                }
            }
            None => {
                // Externally created target we cannot interpret; leave it
                // alone and skip further checks this period.
                warn!(
                    key = %key,
                    target = %current,
                    "Write target name not recognized, skipping rollover for this period"
                );
                self.markers.insert(key.clone(), today);
                Ok(None)
            }
        }
    }

    fn map_remote(
        &self,
        names: &ResourceNames,
        operation: &str,
        error: RemoteError,
    ) -> ProvisionError {
        match error {
            RemoteError::Transient(reason) => ProvisionError::TransientRemote {
                operation: operation.to_string(),
                resource: format!("alias {}", names.alias),
                reason,
            },
            other => ProvisionError::ProvisioningFailed {
                resource: format!("alias {}", names.alias),
                attempts: 1,
                reason: format!("{operation} failed during rollover: {other}"),
            },
        }
    }
}
