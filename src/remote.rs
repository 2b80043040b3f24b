//! # Remote Storage API
//!
//! The surface this core consumes from the backing storage system. All
//! operations are idempotent from the caller's perspective: a conflict on
//! create means some other actor (another worker, an operator) already made
//! the resource, and callers treat it as success.
//!
//! Transport, authentication, and document shapes live in the host pipeline;
//! implementations of [`RemoteApi`] adapt them to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// The kinds of remote resources this core provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Policy,
    Template,
    Alias,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Policy => f.write_str("policy"),
            ResourceKind::Template => f.write_str("template"),
            ResourceKind::Alias => f.write_str("alias"),
        }
    }
}

/// Transport-level outcomes from the remote system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The resource already exists. Treated as success by callers.
    #[error("resource already exists")]
    Conflict,

    /// The resource does not exist.
    #[error("resource not found")]
    NotFound,

    /// Network or server-side failure that may succeed on retry.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Failure that will not be fixed by retrying (bad request, auth).
    #[error("fatal remote failure: {0}")]
    Fatal(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Idempotent existence/create/update operations against the backing store.
///
/// Implementations must be safe to call concurrently; this core guarantees it
/// never issues two concurrent creates for the same key, but distinct keys
/// proceed in parallel and external actors may race on the same names.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn exists_policy(&self, name: &str) -> RemoteResult<bool>;
    async fn create_policy(&self, name: &str, spec: &Value) -> RemoteResult<()>;

    async fn exists_template(&self, name: &str) -> RemoteResult<bool>;
    async fn create_template(&self, name: &str, spec: &Value) -> RemoteResult<()>;

    async fn exists_alias(&self, name: &str) -> RemoteResult<bool>;

    /// Name of the target currently carrying the write flag for `alias`, or
    /// `None` when the alias does not exist.
    async fn get_write_target(&self, alias: &str) -> RemoteResult<Option<String>>;

    /// Create `target` and attach `alias` to it in one call, optionally with
    /// the write flag, referencing `policy_name` for lifecycle management.
    async fn create_target_with_alias(
        &self,
        target: &str,
        alias: &str,
        is_write_target: bool,
        policy_name: &str,
    ) -> RemoteResult<()>;

    /// Atomically move the write flag for `alias` from `from` to `to`. After
    /// this returns, exactly one target carries the write flag. `from` may
    /// equal `to`, which attaches the flag to an existing target.
    async fn repoint_alias(&self, alias: &str, from: &str, to: &str) -> RemoteResult<()>;
}
