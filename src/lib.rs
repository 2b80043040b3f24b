#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Lifecycle Core
//!
//! Resource-provisioning cache for event pipelines that index into a remote
//! storage system with lifecycle management. For every distinct logical key
//! (a container name, a tenant identifier) the cache guarantees that the
//! backing resources are created exactly once: a lifecycle policy, a
//! structural template, and a rollover write-target/alias. Provisioning is
//! safe under concurrent access, stays aligned with the daily rollover
//! period, and self-heals when the remote reports resources missing.
//!
//! ## Architecture
//!
//! - [`cache::ProvisioningCache`]: singleflight controller with one in-flight
//!   initialization per key, waiters on a completion signal, and a Ready fast
//!   path
//! - [`provisioner::ResourceProvisioner`]: ordered ensure of policy, then
//!   template, then write-target/alias, with an existence cache and bounded
//!   retry
//! - [`rollover::RolloverTracker`]: once-per-key-per-period write-target
//!   alignment with the calendar
//! - [`anomaly::AnomalyGuard`]: breaks per-key retry storms with one forced
//!   reset, then fails fast
//! - [`recovery`]: invalidation budget for out-of-band resource loss
//! - [`batch::BatchDeduplicator`]: per-batch duplicate-key suppression
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lifecycle_core::{ProvisionerConfig, ProvisioningCache};
//! # use lifecycle_core::testing::MockRemote;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let remote = Arc::new(MockRemote::new());
//! let cache = ProvisioningCache::new(remote, ProvisionerConfig::default())?;
//!
//! // Before writing an event for a key:
//! let key = cache.ensure_ready("My Container/1").await?;
//! assert_eq!(key.as_str(), "my-container-1");
//! # Ok(())
//! # }
//! ```
//!
//! The cache is a library: key extraction from events, the worker/batching
//! model, transport, and configuration files all belong to the host pipeline.

pub mod anomaly;
pub mod batch;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod key;
pub mod logging;
pub mod provisioner;
pub mod recovery;
pub mod remote;
pub mod rollover;
pub mod testing;

pub use batch::BatchDeduplicator;
pub use cache::{CacheStats, KeySnapshot, KeyStatus, ProvisioningCache};
pub use config::{
    AnomalyConfig, BackoffConfig, NamingConfig, ProvisionerConfig, RecoveryConfig,
};
pub use error::{ProvisionError, Result};
pub use key::{ResourceKey, ResourceNames};
pub use provisioner::EnsureOutcome;
pub use recovery::{RecoveryAdvice, WriteErrorKind};
pub use remote::{RemoteApi, RemoteError, RemoteResult, ResourceKind};
pub use rollover::{Clock, SystemClock};
