//! Structured logging setup.
//!
//! The framework itself only emits `tracing` events; installing a
//! subscriber is left to the application. [`init_logging`] is the
//! batteries-included way to do it:
//!
//! ```rust,no_run
//! use trellis_server::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::development()).expect("logging");
//! tracing::info!(conn_id = 7_u64, "connection accepted");
//! ```
//!
//! `RUST_LOG`, when set, takes precedence over [`LogConfig::level`].

use thiserror::Error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging could not be initialised.
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The level or filter directive is invalid.
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether to install a subscriber at all.
    pub enabled: bool,

    /// Filter directive, e.g. `"info"` or `"trellis_server=debug,info"`.
    pub level: String,

    /// JSON output instead of the human-readable format.
    pub json_format: bool,

    /// Include the event target (module path).
    pub include_target: bool,

    /// Include file and line.
    pub include_location: bool,

    /// Emit span open/close events.
    pub span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl LogConfig {
    /// Human-readable output at `debug`, with locations and span events.
    #[must_use]
    pub fn development() -> Self {
        Self {
            enabled: true,
            level: "debug".to_string(),
            json_format: false,
            include_target: true,
            include_location: true,
            span_events: true,
        }
    }

    /// JSON output at `info`.
    #[must_use]
    pub fn production() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json_format: true,
            include_target: true,
            include_location: false,
            span_events: false,
        }
    }

    /// The effective filter: `RUST_LOG` if set, else [`level`](Self::level).
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
            _ => EnvFilter::try_new(&self.level),
        };
        filter.map_err(|e| LoggingError::InvalidFilter(e.to_string()))
    }
}

/// Installs the global subscriber described by `config`.
///
/// Calling it twice returns [`LoggingError::Init`].
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    if !config.enabled {
        return Ok(());
    }

    let filter = config.filter()?;
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target)
            .with_filter(filter);
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target)
            .with_filter(filter);
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    }
}

/// Field names used in framework events.
pub mod fields {
    /// Connection identifier.
    pub const CONN_ID: &str = "conn_id";

    /// Connection protocol tag.
    pub const CONN_KIND: &str = "kind";

    /// Peer address.
    pub const PEER: &str = "peer";

    /// Listen address.
    pub const ADDR: &str = "addr";

    /// Hook name.
    pub const HOOK: &str = "hook";

    /// Remaining connections during shutdown.
    pub const REMAINING: &str = "remaining";

    /// Elapsed time in milliseconds.
    pub const ELAPSED_MS: &str = "elapsed_ms";

    /// HTTP method.
    pub const HTTP_METHOD: &str = "http.method";

    /// Request path.
    pub const HTTP_PATH: &str = "http.path";

    /// Error description.
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let dev = LogConfig::development();
        assert!(!dev.json_format);
        assert!(dev.span_events);
        assert_eq!(dev.level, "debug");

        let prod = LogConfig::production();
        assert!(prod.json_format);
        assert!(!prod.include_location);
        assert_eq!(LogConfig::default(), prod);
    }

    #[test]
    fn test_disabled_is_noop() {
        let config = LogConfig {
            enabled: false,
            level: "not a level ===".to_string(),
            ..LogConfig::default()
        };
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            level: "warn".to_string(),
            ..LogConfig::production()
        };
        // Another test may already have installed a subscriber; either
        // way the second call must fail cleanly.
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(LoggingError::Init(_))));
    }
}
