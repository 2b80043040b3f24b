//! Error types for the lifecycle provisioning core.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the provisioning cache and its collaborators.
///
/// The caller alone decides final event disposition (drop, dead-letter, fail
/// the pipeline); this library never makes that decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisionError {
    /// A raw key (or a name derived from it) failed the remote naming rules.
    /// Non-retryable for that value.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A network or server-side failure during an exists/create call that may
    /// succeed on a later attempt.
    #[error("Transient remote error during {operation} on {resource}: {reason}")]
    TransientRemote {
        operation: String,
        resource: String,
        reason: String,
    },

    /// Retries for a resource were exhausted (or the remote failed fatally)
    /// without the key reaching Ready.
    #[error("Provisioning failed for {resource} after {attempts} attempts: {reason}")]
    ProvisioningFailed {
        resource: String,
        attempts: u32,
        reason: String,
    },

    /// A claim loser waited out the bounded timeout while another caller held
    /// the initialization for this key. Retryable.
    #[error("Initialization for {key} timed out after {waited:?} waiting on the in-flight owner")]
    InitializationTimeout { key: String, waited: Duration },

    /// The in-flight owner for this key finished with a failure; this caller
    /// did not run any remote calls itself. Retryable.
    #[error("Initialization for {key} failed in the concurrent owner")]
    InitializationFailed { key: String },

    /// Repeated provisioning failures tripped the anomaly guard. The key got
    /// exactly one forced reset; this error means the post-reset attempt also
    /// failed and the key is now fatal until invalidated.
    #[error("Anomaly detected for {key}: {failure_count} provisioning failures, forced reset exhausted")]
    AnomalyDetected { key: String, failure_count: u32 },

    /// The bounded recovery budget for a key was exceeded.
    #[error("Recovery exhausted for {key}: {attempts} invalidations without a stable write target")]
    RecoveryExhausted { key: String, attempts: u32 },
}

impl ProvisionError {
    /// Whether the caller may reasonably retry the same operation for the
    /// same key without any other intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::TransientRemote { .. }
                | ProvisionError::InitializationTimeout { .. }
                | ProvisionError::InitializationFailed { .. }
        )
    }
}

pub type Result<T> = anyhow::Result<T, ProvisionError>;
