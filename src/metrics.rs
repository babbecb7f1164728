//! Metrics emitted by the retry loop and the change-op phase.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::retry::ActionType;

/// Where metrics go.
pub trait MetricsSink: Send + Sync {
    /// Attempts one retried action took, successful or not.
    fn record_attempts(&self, action: ActionType, attempts: u32);

    /// A retried action gave up.
    fn increment_timeout(&self, action: ActionType);

    /// Time spent in `phase` of a batch update.
    fn record_latency(&self, phase: &'static str, elapsed: Duration, success: bool);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_attempts(&self, _action: ActionType, _attempts: u32) {}

    fn increment_timeout(&self, _action: ActionType) {}

    fn record_latency(&self, _phase: &'static str, _elapsed: Duration, _success: bool) {}
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    attempts: Mutex<Vec<(ActionType, u32)>>,
    timeouts: Mutex<HashMap<ActionType, u64>>,
    latencies: Mutex<Vec<(&'static str, Duration, bool)>>,
}

impl InMemoryMetrics {
    /// Empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt-count sample, oldest first.
    #[must_use]
    pub fn attempts(&self) -> Vec<(ActionType, u32)> {
        self.attempts.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Timeout counter for `action`.
    #[must_use]
    pub fn timeouts(&self, action: ActionType) -> u64 {
        self.timeouts
            .lock()
            .ok()
            .and_then(|g| g.get(&action).copied())
            .unwrap_or(0)
    }

    /// Every latency sample, oldest first.
    #[must_use]
    pub fn latencies(&self) -> Vec<(&'static str, Duration, bool)> {
        self.latencies.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_attempts(&self, action: ActionType, attempts: u32) {
        if let Ok(mut g) = self.attempts.lock() {
            g.push((action, attempts));
        }
    }

    fn increment_timeout(&self, action: ActionType) {
        if let Ok(mut g) = self.timeouts.lock() {
            *g.entry(action).or_default() += 1;
        }
    }

    fn record_latency(&self, phase: &'static str, elapsed: Duration, success: bool) {
        if let Ok(mut g) = self.latencies.lock() {
            g.push((phase, elapsed, success));
        }
    }
}
