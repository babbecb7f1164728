//! Retry loop around whole update attempts.
//!
//! An action receives the [`BatchUpdateFactory`] and builds every update it
//! needs from scratch, so a retried attempt never sees state left over from
//! the failed one. Only [`UpdateError::is_retryable`] failures are retried.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::batch_update::BatchUpdateFactory;
use crate::error::UpdateError;

/// What kind of work is retried. Timeouts and metrics are kept per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    /// Change metadata updates.
    ChangeUpdate,
    /// Account data updates.
    AccountUpdate,
    /// Group data updates.
    GroupUpdate,
    /// Index reads that may race a writer.
    IndexQuery,
    /// Updates driven by extensions.
    PluginUpdate,
}

impl ActionType {
    /// Snake-case name used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChangeUpdate => "change_update",
            Self::AccountUpdate => "account_update",
            Self::GroupUpdate => "group_update",
            Self::IndexQuery => "index_query",
            Self::PluginUpdate => "plugin_update",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Told about every retry before the backoff sleep.
pub trait RetryListener: Send + Sync {
    /// Attempt `attempt` (1-based) failed with `cause` and will be retried.
    fn on_retry(&self, attempt: u32, cause: &UpdateError);
}

/// Per-call overrides.
#[derive(Clone, Default)]
pub struct RetryOptions {
    timeout: Option<Duration>,
    multiplier: Option<u32>,
    listener: Option<Arc<dyn RetryListener>>,
}

impl RetryOptions {
    /// Configured defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `timeout` instead of the configured one.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Scale the timeout, for call sites known to do a lot of work.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Notify `listener` before each retry.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("timeout", &self.timeout)
            .field("multiplier", &self.multiplier)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Runs actions in a lock-failure retry loop.
#[derive(Clone, Debug)]
pub struct RetryHelper {
    factory: BatchUpdateFactory,
}

impl RetryHelper {
    /// Retry helper building updates with `factory`.
    #[must_use]
    pub const fn new(factory: BatchUpdateFactory) -> Self {
        Self { factory }
    }

    /// The factory handed to actions.
    #[must_use]
    pub const fn factory(&self) -> &BatchUpdateFactory {
        &self.factory
    }

    /// Run a change update with the configured defaults.
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub fn execute_change_update<T>(
        &self,
        action: impl FnMut(&BatchUpdateFactory) -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        self.execute(ActionType::ChangeUpdate, &RetryOptions::default(), action)
    }

    /// Run `action` until it succeeds, fails with a non-retryable error, or
    /// the timeout passes. A running attempt is never interrupted; the
    /// timeout is checked after each failed attempt.
    ///
    /// # Errors
    /// - The first non-retryable failure, unchanged.
    /// - `Timeout` wrapping the last lock failure once time runs out.
    pub fn execute<T>(
        &self,
        action_type: ActionType,
        options: &RetryOptions,
        mut action: impl FnMut(&BatchUpdateFactory) -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        let retry = &self.factory.config().retry;
        let metrics = self.factory.metrics();
        let timeout = options.timeout.unwrap_or_else(|| retry.timeout(action_type))
            * options.multiplier.unwrap_or(1).max(1);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match action(&self.factory) {
                Ok(value) => {
                    metrics.record_attempts(action_type, attempt);
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    metrics.record_attempts(action_type, attempt);
                    return Err(e);
                }
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                metrics.record_attempts(action_type, attempt);
                metrics.increment_timeout(action_type);
                tracing::info!(
                    action = %action_type,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis(),
                    "giving up after lock failures"
                );
                return Err(UpdateError::Timeout {
                    action: action_type.to_string(),
                    attempts: attempt,
                    elapsed,
                    source: Box::new(err),
                });
            }

            let wait = backoff(attempt, retry.max_wait(), retry.jitter_ms).min(timeout - elapsed);
            tracing::info!(
                action = %action_type,
                attempt,
                wait_ms = wait.as_millis(),
                error = %err,
                "retrying after lock failure"
            );
            if let Some(listener) = &options.listener {
                listener.on_retry(attempt, &err);
            }
            std::thread::sleep(wait);
        }
    }
}

/// `2^attempt` ms capped at `max_wait`, plus up to `jitter_ms` of jitter.
fn backoff(attempt: u32, max_wait: Duration, jitter_ms: u64) -> Duration {
    let exp = Duration::from_millis(1u64 << attempt.min(20));
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_ms)
    };
    exp.min(max_wait) + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let max = Duration::from_millis(100);
        for attempt in 1..40 {
            let wait = backoff(attempt, max, 0);
            assert!(wait <= max, "attempt {attempt}: {wait:?}");
        }
        assert_eq!(backoff(3, max, 0), Duration::from_millis(8));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..200 {
            let wait = backoff(1, Duration::from_secs(5), 50);
            assert!(wait >= Duration::from_millis(2));
            assert!(wait <= Duration::from_millis(52));
        }
    }

    #[test]
    fn action_names() {
        assert_eq!(ActionType::ChangeUpdate.to_string(), "change_update");
        assert_eq!(ActionType::IndexQuery.as_str(), "index_query");
    }
}
