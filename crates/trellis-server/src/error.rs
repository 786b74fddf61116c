//! Error types for the server crate.
//!
//! - [`ShutdownError`] is the outcome of a shutdown call. It is `Clone` so
//!   the same value can be handed to post-shutdown hooks and per-connection
//!   callbacks.
//! - [`ServerError`] covers binding, accepting and serving.
//! - [`LifecycleError`] is what user hooks return.
//! - [`ConfigError`] covers loading and validating [`AppConfig`].
//!
//! [`AppConfig`]: crate::AppConfig

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Outcome of a graceful shutdown.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownError {
    /// The application has already stopped.
    #[error("server is not running")]
    NotRunning,

    /// The shutdown context was cancelled before draining finished.
    #[error("shutdown canceled")]
    Canceled,

    /// The effective deadline passed before draining finished.
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,

    /// A WebSocket peer did not answer the close frame in time.
    #[error("websocket close timed out")]
    WebSocketCloseTimeout,

    /// An SSE stream did not finish after the shutdown event in time.
    #[error("sse close timed out")]
    SseCloseTimeout,
}

impl ShutdownError {
    /// Whether the shutdown ran out of time.
    #[must_use]
    pub const fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Whether the shutdown context was cancelled.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Errors raised while running the transport.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Binding the listen address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The application could not be frozen for serving.
    #[error("application setup failed: {0}")]
    Setup(#[from] trellis_core::Error),

    /// A listen hook failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Graceful shutdown after a signal did not complete cleanly.
    #[error("shutdown failed: {0}")]
    Shutdown(#[from] ShutdownError),

    /// A handler panicked and no recover hook was installed. The
    /// connection is dropped.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

/// Result type for [`ServerError`].
pub type ServerResult<T> = Result<T, ServerError>;

/// Failure reported by a user hook.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A named hook failed.
    #[error("hook '{hook}' failed: {message}")]
    Hook {
        /// Name the hook was registered under.
        hook: String,
        /// What went wrong.
        message: String,
    },

    /// A hook failed with an underlying error.
    #[error("lifecycle hook error: {message}")]
    HookError {
        /// What went wrong.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LifecycleError {
    /// A hook error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::HookError {
            message: message.into(),
            source: None,
        }
    }

    /// A hook error wrapping `source`.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::HookError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Attributes the error to `hook`.
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for LifecycleError {
    fn from(err: anyhow::Error) -> Self {
        Self::HookError {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// Result type for hooks.
pub type LifecycleResult<T = ()> = Result<T, LifecycleError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// Failed to read the configuration file.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML configuration: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Unsupported file extension.
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A value failed validation.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },
}

impl ConfigError {
    /// File-not-found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Read error for `path`.
    pub fn read_error(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    /// Invalid-value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_predicates() {
        assert!(ShutdownError::DeadlineExceeded.is_deadline_exceeded());
        assert!(ShutdownError::Canceled.is_canceled());
        assert!(!ShutdownError::NotRunning.is_canceled());
        assert_eq!(
            ShutdownError::WebSocketCloseTimeout.to_string(),
            "websocket close timed out"
        );
    }

    #[test]
    fn test_lifecycle_error_from_anyhow() {
        let err: LifecycleError = anyhow::anyhow!("flush failed").into();
        assert_eq!(err.to_string(), "lifecycle hook error: flush failed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid_value("body_limit", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid configuration value for body_limit: must be greater than zero"
        );
    }
}
