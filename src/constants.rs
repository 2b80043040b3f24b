//! # System Constants
//!
//! Default thresholds, naming conventions, and limits shared across the
//! provisioning components. Config structs default to these values; they are
//! kept here so tests and documentation reference a single source.

/// Suffix appended to a key to derive its lifecycle policy name.
pub const POLICY_SUFFIX: &str = "-ilm-policy";

/// Prefix prepended to a key to derive its structural template name.
pub const TEMPLATE_PREFIX: &str = "logstash-";

/// Date format embedded in write-target names (`nginx-2025.11.20-000001`).
pub const TARGET_DATE_FORMAT: &str = "%Y.%m.%d";

/// First generation number assigned to a key's write target.
pub const INITIAL_GENERATION: u32 = 1;

/// Width of the zero-padded generation suffix in target names.
pub const GENERATION_WIDTH: usize = 6;

/// Upper bound the remote system places on resource names.
pub const MAX_REMOTE_NAME_LENGTH: usize = 255;

/// Upper bound on a normalized key, leaving room for prefixes, the embedded
/// date, and the generation suffix within [`MAX_REMOTE_NAME_LENGTH`].
pub const DEFAULT_MAX_KEY_LENGTH: usize = 100;

/// Characters a normalized key (and derived names) may not start with.
pub const DISALLOWED_LEADING_CHARS: [char; 4] = ['-', '_', '+', '.'];

/// How long a claim loser waits on the in-flight owner before returning a
/// retryable timeout.
pub const DEFAULT_INIT_WAIT_TIMEOUT_SECONDS: u64 = 5;

/// Remote create/exists attempts before a transient failure becomes terminal.
pub const DEFAULT_MAX_REMOTE_ATTEMPTS: u32 = 3;

/// Base delay for the first retry of a transient remote failure.
pub const DEFAULT_BACKOFF_BASE_DELAY_MS: u64 = 100;

/// Cap on any single backoff delay.
pub const DEFAULT_BACKOFF_MAX_DELAY_MS: u64 = 5_000;

/// Consecutive per-key provisioning failures tolerated before the anomaly
/// guard forces a cache reset.
pub const DEFAULT_ANOMALY_FAILURE_THRESHOLD: u32 = 10;

/// Window within which anomaly failures are counted as one streak.
pub const DEFAULT_ANOMALY_WINDOW_SECONDS: u64 = 300;

/// Cache invalidations tolerated per key within the recovery window before
/// recovery is declared exhausted.
pub const DEFAULT_RECOVERY_MAX_ATTEMPTS: u32 = 2;

/// Window within which recovery attempts are counted against the budget.
pub const DEFAULT_RECOVERY_WINDOW_SECONDS: u64 = 60;
