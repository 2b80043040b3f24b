//! # Provisioner Configuration
//!
//! Explicit, validated configuration for the provisioning cache and its
//! collaborators. All structs carry environment-appropriate defaults and
//! derive serde traits so the host pipeline's configuration layer (YAML, env,
//! whatever it uses) can populate them; this library never reads files or
//! environment variables for configuration itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants;
use crate::error::{ProvisionError, Result};

/// Root configuration for [`ProvisioningCache`](crate::cache::ProvisioningCache).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// How long a claim loser waits on the in-flight owner before returning a
    /// retryable timeout.
    pub init_wait_timeout_seconds: u64,

    /// Retry and backoff behavior for transient remote failures.
    pub backoff: BackoffConfig,

    /// Anomaly detection thresholds.
    pub anomaly: AnomalyConfig,

    /// Recovery budget for out-of-band resource loss.
    pub recovery: RecoveryConfig,

    /// Deterministic name derivation rules.
    pub naming: NamingConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            init_wait_timeout_seconds: constants::DEFAULT_INIT_WAIT_TIMEOUT_SECONDS,
            backoff: BackoffConfig::default(),
            anomaly: AnomalyConfig::default(),
            recovery: RecoveryConfig::default(),
            naming: NamingConfig::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Validate the whole configuration tree, rejecting values that would
    /// produce silent misbehavior at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.init_wait_timeout_seconds == 0 {
            return Err(ProvisionError::ValidationError(
                "init_wait_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()?;
        self.anomaly.validate()?;
        self.recovery.validate()?;
        self.naming.validate()
    }

    pub fn init_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.init_wait_timeout_seconds)
    }
}

/// Bounded exponential backoff for remote calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total attempts per remote operation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per subsequent retry.
    pub backoff_multiplier: f64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Whether to add randomized jitter to each delay.
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the computed delay.
    pub jitter_max_percentage: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_REMOTE_ATTEMPTS,
            base_delay_ms: constants::DEFAULT_BACKOFF_BASE_DELAY_MS,
            backoff_multiplier: 2.0,
            max_delay_ms: constants::DEFAULT_BACKOFF_MAX_DELAY_MS,
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProvisionError::ValidationError(
                "backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ProvisionError::ValidationError(format!(
                "backoff.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_max_percentage) {
            return Err(ProvisionError::ValidationError(format!(
                "backoff.jitter_max_percentage must be within [0.0, 1.0], got {}",
                self.jitter_max_percentage
            )));
        }
        Ok(())
    }

    /// Delay before the retry following `attempt` (1-based attempt that just
    /// failed). Exponential in the attempt number, capped, optionally
    /// jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = Duration::from_millis(self.base_delay_ms)
            .mul_f64(self.backoff_multiplier.powi(exponent as i32));
        let capped = base.min(Duration::from_millis(self.max_delay_ms));

        if self.jitter_enabled && self.jitter_max_percentage > 0.0 {
            let jitter = fastrand::f64() * self.jitter_max_percentage;
            capped
                .mul_f64(1.0 + jitter)
                .min(Duration::from_millis(self.max_delay_ms))
        } else {
            capped
        }
    }
}

/// Thresholds for the per-key anomaly guard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Failures tolerated within the window before a forced reset.
    pub failure_threshold: u32,
    /// Window within which failures count as one streak.
    pub window_seconds: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: constants::DEFAULT_ANOMALY_FAILURE_THRESHOLD,
            window_seconds: constants::DEFAULT_ANOMALY_WINDOW_SECONDS,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ProvisionError::ValidationError(
                "anomaly.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(ProvisionError::ValidationError(
                "anomaly.window_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Budget for write-failure recovery per key.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Invalidations tolerated per key within the window.
    pub max_attempts: u32,
    /// Window within which attempts count against the budget.
    pub window_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_RECOVERY_MAX_ATTEMPTS,
            window_seconds: constants::DEFAULT_RECOVERY_WINDOW_SECONDS,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProvisionError::ValidationError(
                "recovery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(ProvisionError::ValidationError(
                "recovery.window_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Deterministic name derivation rules for remote resources.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Suffix appended to the key for the lifecycle policy name.
    pub policy_suffix: String,
    /// Prefix prepended to the key for the template name.
    pub template_prefix: String,
    /// Maximum length of a normalized key.
    pub max_key_length: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            policy_suffix: constants::POLICY_SUFFIX.to_string(),
            template_prefix: constants::TEMPLATE_PREFIX.to_string(),
            max_key_length: constants::DEFAULT_MAX_KEY_LENGTH,
        }
    }
}

impl NamingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_key_length == 0 || self.max_key_length > constants::MAX_REMOTE_NAME_LENGTH {
            return Err(ProvisionError::ValidationError(format!(
                "naming.max_key_length must be within 1..={}, got {}",
                constants::MAX_REMOTE_NAME_LENGTH,
                self.max_key_length
            )));
        }
        // Affixes end up inside derived names, so they obey the same charset.
        for (field, value) in [
            ("naming.policy_suffix", &self.policy_suffix),
            ("naming.template_prefix", &self.template_prefix),
        ] {
            if !value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ProvisionError::ValidationError(format!(
                    "{field} contains characters outside the remote naming rules: {value:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        ProvisionerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = ProvisionerConfig::default();
        config.backoff.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ProvisionError::ValidationError(_))
        ));
    }

    #[test]
    fn multiplier_below_one_rejected() {
        let config = BackoffConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn delays_grow_and_cap() {
        let config = BackoffConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 350,
            jitter_enabled: false,
            jitter_max_percentage: 0.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        // Capped at max_delay_ms from the third attempt on.
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let config = BackoffConfig {
            jitter_enabled: true,
            jitter_max_percentage: 0.5,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        for attempt in 1..=8 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn invalid_affix_rejected() {
        let config = NamingConfig {
            template_prefix: "Logstash/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_serde() {
        let config = ProvisionerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ProvisionerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.backoff.max_attempts, config.backoff.max_attempts);
        assert_eq!(back.naming.policy_suffix, config.naming.policy_suffix);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let back: ProvisionerConfig =
            serde_json::from_str(r#"{"anomaly": {"failure_threshold": 3}}"#).unwrap();
        assert_eq!(back.anomaly.failure_threshold, 3);
        assert_eq!(
            back.anomaly.window_seconds,
            crate::constants::DEFAULT_ANOMALY_WINDOW_SECONDS
        );
        assert_eq!(
            back.backoff.max_attempts,
            crate::constants::DEFAULT_MAX_REMOTE_ATTEMPTS
        );
    }
}
