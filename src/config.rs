//! Engine configuration (`refbatch.toml`).
//!
//! Every field has a default; a missing file yields the defaults and unknown
//! keys are rejected.
//!
//! ```toml
//! [retry]
//! timeout_ms = 20000
//! max_wait_ms = 5000
//! jitter_ms = 50
//!
//! [retry.timeouts]
//! change_update = 30000
//!
//! [update]
//! atomic_ref_updates = true
//! change_update_threads = 4
//! async_post_update_threads = 2
//! await_indexing = true
//! shared_project = "All-Users"
//! ignore_shared_write_failures = true
//! max_refs_per_batch = 1000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::retry::ActionType;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefbatchConfig {
    /// Retry loop settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Batch update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Retry loop settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Time after which no further attempt is started (default: 20 s).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cap on the exponential backoff between attempts (default: 5 s).
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Upper bound of the random jitter added to every wait (default: 50 ms).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Per-action overrides of `timeout_ms`.
    #[serde(default)]
    pub timeouts: ActionTimeouts,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_wait_ms: default_max_wait_ms(),
            jitter_ms: default_jitter_ms(),
            timeouts: ActionTimeouts::default(),
        }
    }
}

impl RetryConfig {
    /// Timeout for `action`: its override if set, else `timeout_ms`.
    #[must_use]
    pub fn timeout(&self, action: ActionType) -> Duration {
        let ms = match action {
            ActionType::ChangeUpdate => self.timeouts.change_update,
            ActionType::AccountUpdate => self.timeouts.account_update,
            ActionType::GroupUpdate => self.timeouts.group_update,
            ActionType::IndexQuery => self.timeouts.index_query,
            ActionType::PluginUpdate => self.timeouts.plugin_update,
        };
        Duration::from_millis(ms.unwrap_or(self.timeout_ms))
    }

    /// Backoff cap.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

const fn default_timeout_ms() -> u64 {
    20_000
}

const fn default_max_wait_ms() -> u64 {
    5_000
}

const fn default_jitter_ms() -> u64 {
    50
}

/// Per-action timeout overrides in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionTimeouts {
    /// Change updates.
    #[serde(default)]
    pub change_update: Option<u64>,
    /// Account updates.
    #[serde(default)]
    pub account_update: Option<u64>,
    /// Group updates.
    #[serde(default)]
    pub group_update: Option<u64>,
    /// Index queries.
    #[serde(default)]
    pub index_query: Option<u64>,
    /// Plugin-driven updates.
    #[serde(default)]
    pub plugin_update: Option<u64>,
}

// ---------------------------------------------------------------------------
// UpdateConfig
// ---------------------------------------------------------------------------

/// Batch update settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfig {
    /// Execute repository and metadata ref commands in one atomic batch
    /// (default: `true`). When `false` they run as two batches.
    #[serde(default = "default_true")]
    pub atomic_ref_updates: bool,

    /// Workers for parallel `update_change` (default: 4).
    #[serde(default = "default_change_update_threads")]
    pub change_update_threads: usize,

    /// Workers for async post-update ops (default: 2).
    #[serde(default = "default_async_post_update_threads")]
    pub async_post_update_threads: usize,

    /// Wait for reindexing before post-update ops (default: `true`).
    #[serde(default = "default_true")]
    pub await_indexing: bool,

    /// Project holding per-account data such as draft comments.
    #[serde(default = "default_shared_project")]
    pub shared_project: String,

    /// Log and drop a failed shared-project write after the change
    /// repository write succeeded (default: `true`).
    #[serde(default = "default_true")]
    pub ignore_shared_write_failures: bool,

    /// Ref count callers of the incremental executor chunk against.
    #[serde(default = "default_max_refs_per_batch")]
    pub max_refs_per_batch: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            atomic_ref_updates: true,
            change_update_threads: default_change_update_threads(),
            async_post_update_threads: default_async_post_update_threads(),
            await_indexing: true,
            shared_project: default_shared_project(),
            ignore_shared_write_failures: true,
            max_refs_per_batch: default_max_refs_per_batch(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_change_update_threads() -> usize {
    4
}

const fn default_async_post_update_threads() -> usize {
    2
}

fn default_shared_project() -> String {
    "All-Users".to_owned()
}

const fn default_max_refs_per_batch() -> usize {
    1000
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl RefbatchConfig {
    /// Load configuration from a TOML file; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }
}
