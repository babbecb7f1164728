//! Tracing subscriber setup.
//!
//! Controlled by `REFBATCH_LOG`:
//! - unset or empty → nothing installed (events are dropped)
//! - `"json"` → JSON events and span closes to stderr
//! - `"pretty"` → human-readable events to stderr
//!
//! `RUST_LOG` sets the filter in both modes (default `info`).

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Output format selected by `REFBATCH_LOG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line, human-readable.
    Pretty,
}

impl LogFormat {
    /// The format named by `value`; `None` for an unset or unknown value.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            Some("json") => Some(Self::Json),
            Some("pretty") => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Install the global subscriber selected by `REFBATCH_LOG`.
///
/// Returns the installed format. Does nothing if a subscriber is already
/// installed.
pub fn init() -> Option<LogFormat> {
    let value = std::env::var("REFBATCH_LOG").ok();
    let format = LogFormat::from_env_value(value.as_deref());
    match format {
        None => {
            if value.as_deref().is_some_and(|v| !v.is_empty()) {
                eprintln!("warning: unknown REFBATCH_LOG value, expected json or pretty");
            }
        }
        Some(LogFormat::Json) => init_json(),
        Some(LogFormat::Pretty) => init_pretty(),
    }
    format
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init();
}

fn init_pretty() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Route events to the test harness's captured output. Safe to call from
/// every test.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("refbatch=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!(LogFormat::from_env_value(Some("json")), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_env_value(Some(" pretty ")), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::from_env_value(Some("xml")), None);
        assert_eq!(LogFormat::from_env_value(None), None);
    }

    #[test]
    fn init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still alive");
    }
}
