//! Error types for Trellis.
//!
//! [`Error`] is the single error type that flows through handlers, the
//! `next` chain and the application error handler. Registration problems
//! (bad patterns, bad host patterns, mount cycles) share the same type so
//! they can be propagated with `?` from startup code.

use http::StatusCode;
use thiserror::Error;
use trellis_router::{DomainError, PatternError};

/// Result type alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Standard error type for Trellis.
///
/// # Example
///
/// ```
/// use http::StatusCode;
/// use trellis_core::Error;
///
/// let err = Error::not_found("no such user");
/// assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
/// assert_eq!(err.message(), "no such user");
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// An HTTP error carrying its own status.
    #[error("{message}")]
    Http {
        /// Response status.
        status: StatusCode,
        /// Message written by the default error handler.
        message: String,
    },

    /// The application began shutting down while the request was in
    /// flight.
    #[error("request canceled: server is shutting down")]
    RequestShutdown,

    /// A route pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// A host pattern failed to parse.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// An application was mounted into itself, directly or transitively.
    #[error("mount cycle: application '{0}' is already part of the mount chain")]
    MountCycle(String),

    /// I/O failure while serving the request.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed multipart body.
    #[error("multipart error: {0}")]
    Multipart(String),

    /// Internal server error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// The underlying error (not exposed to clients).
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl Error {
    /// Creates an HTTP error with an explicit status.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates an HTTP error whose message is the canonical reason phrase.
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or("Unknown Status Code"))
    }

    /// Creates a 404 error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Creates a 400 error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Creates an internal error with a message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error with a source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the HTTP status code the default error handler uses.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            Self::RequestShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::Pattern(_)
            | Self::Domain(_)
            | Self::MountCycle(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the message written to clients.
    ///
    /// Internal failures never leak their source; clients see the reason
    /// phrase instead.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Http { message, .. } => message.clone(),
            Self::RequestShutdown | Self::Multipart(_) => self.to_string(),
            _ => self
                .status_code()
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
        }
    }

    /// Returns true for the shutdown sentinel.
    #[must_use]
    pub fn is_request_shutdown(&self) -> bool {
        matches!(self, Self::RequestShutdown)
    }

    /// Returns true for errors raised while registering routes or mounts.
    #[must_use]
    pub fn is_registration(&self) -> bool {
        matches!(self, Self::Pattern(_) | Self::Domain(_) | Self::MountCycle(_))
    }
}

impl From<multer::Error> for Error {
    fn from(err: multer::Error) -> Self {
        Self::Multipart(err.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Self::internal_with_source("invalid HTTP response", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_router::{PatternOptions, RoutePattern};

    #[test]
    fn test_http_error_status_and_message() {
        let err = Error::new(StatusCode::IM_A_TEAPOT, "short and stout");
        assert_eq!(err.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(err.message(), "short and stout");
        assert_eq!(err.to_string(), "short and stout");
    }

    #[test]
    fn test_status_uses_reason_phrase() {
        let err = Error::status(StatusCode::FORBIDDEN);
        assert_eq!(err.message(), "Forbidden");
    }

    #[test]
    fn test_internal_hides_source() {
        let err = Error::internal_with_source("db exploded", anyhow::anyhow!("password=hunter2"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "Internal Server Error");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_request_shutdown() {
        let err = Error::RequestShutdown;
        assert!(err.is_request_shutdown());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_pattern_error_converts() {
        let err: Error = RoutePattern::compile("/:a/:a", PatternOptions::default())
            .unwrap_err()
            .into();
        assert!(err.is_registration());
        assert!(matches!(err, Error::Pattern(_)));
    }

    #[test]
    fn test_json_error_is_internal() {
        let err: Error = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
