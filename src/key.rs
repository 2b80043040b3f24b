//! # Resource Keys and Name Derivation
//!
//! A [`ResourceKey`] is the normalized identifier scoping one set of remote
//! lifecycle resources (policy, template, alias). Raw keys arrive from the
//! event pipeline (container names, tenant identifiers) and are normalized
//! here; a key that cannot be normalized into a valid remote name is rejected
//! with a `ValidationError` before any remote call is made.
//!
//! Derived names are deterministic: key `nginx` yields policy
//! `nginx-ilm-policy`, template `logstash-nginx`, alias `nginx`, and write
//! targets of the form `nginx-2025.11.20-000001`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::NamingConfig;
use crate::constants;
use crate::error::{ProvisionError, Result};

/// Normalized identifier scoping a set of lifecycle resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Normalize a raw key and validate the result against the remote naming
    /// rules. Lowercases, replaces disallowed characters with `-`, strips
    /// disallowed leading characters, and bounds the length.
    pub fn normalize(raw: &str, naming: &NamingConfig) -> Result<Self> {
        let mut normalized = String::with_capacity(raw.len());
        for ch in raw.trim().chars().flat_map(char::to_lowercase) {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.') {
                normalized.push(ch);
            } else {
                normalized.push('-');
            }
        }

        let stripped = normalized.trim_start_matches(constants::DISALLOWED_LEADING_CHARS);
        let bounded: String = stripped.chars().take(naming.max_key_length).collect();

        if bounded.is_empty() {
            return Err(ProvisionError::ValidationError(format!(
                "key {raw:?} normalizes to an empty string"
            )));
        }
        if bounded == "." || bounded == ".." {
            return Err(ProvisionError::ValidationError(format!(
                "key {raw:?} normalizes to a reserved name {bounded:?}"
            )));
        }

        Ok(Self(bounded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The deterministic name set derived from one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    pub policy: String,
    pub template: String,
    pub alias: String,
}

impl ResourceNames {
    /// Derive and validate the full name set for a key. A derived name that
    /// violates the remote naming rules aborts provisioning for that key.
    pub fn derive(key: &ResourceKey, naming: &NamingConfig) -> Result<Self> {
        let names = Self {
            policy: format!("{}{}", key.as_str(), naming.policy_suffix),
            template: format!("{}{}", naming.template_prefix, key.as_str()),
            alias: key.as_str().to_string(),
        };
        for name in [&names.policy, &names.template, &names.alias] {
            validate_remote_name(name)?;
        }
        Ok(names)
    }

    /// Index pattern the template matches; write targets for this key embed
    /// the key as their prefix, so they always fall under it.
    pub fn index_pattern(&self) -> String {
        format!("{}-*", self.alias)
    }
}

/// Validate a single derived name against the remote system's rules:
/// lowercase, restricted character set, bounded length, no reserved or
/// leading-character violations.
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::ValidationError(
            "derived resource name is empty".to_string(),
        ));
    }
    if name.len() > constants::MAX_REMOTE_NAME_LENGTH {
        return Err(ProvisionError::ValidationError(format!(
            "derived resource name exceeds {} bytes: {name:?}",
            constants::MAX_REMOTE_NAME_LENGTH
        )));
    }
    if name.starts_with(constants::DISALLOWED_LEADING_CHARS) {
        return Err(ProvisionError::ValidationError(format!(
            "derived resource name starts with a disallowed character: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ProvisionError::ValidationError(format!(
            "derived resource name contains disallowed characters: {name:?}"
        )));
    }
    Ok(())
}

/// Write-target name for a key, period, and generation:
/// `{key}-{yyyy.MM.dd}-{generation:06}`.
pub fn write_target_name(key: &ResourceKey, period: NaiveDate, generation: u32) -> String {
    format!(
        "{}-{}-{:0width$}",
        key.as_str(),
        period.format(constants::TARGET_DATE_FORMAT),
        generation,
        width = constants::GENERATION_WIDTH
    )
}

/// Parse the embedded period and generation out of a write-target name.
/// Returns `None` for names not produced by [`write_target_name`], e.g.
/// targets created out-of-band.
pub fn parse_write_target(name: &str) -> Option<(NaiveDate, u32)> {
    let (rest, generation) = name.rsplit_once('-')?;
    if generation.len() != constants::GENERATION_WIDTH {
        return None;
    }
    let generation: u32 = generation.parse().ok()?;
    let (_, date) = rest.rsplit_once('-')?;
    let period = NaiveDate::parse_from_str(date, constants::TARGET_DATE_FORMAT).ok()?;
    Some((period, generation))
}
