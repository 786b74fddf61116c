//! Errors produced while compiling route and domain patterns.

use thiserror::Error;

/// An error raised when a route pattern cannot be compiled.
///
/// These are registration-time errors: the application surfaces them
/// synchronously from the registration call and must not start serving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern is syntactically invalid.
    #[error("invalid pattern {pattern:?}: {reason}")]
    Invalid {
        /// The offending pattern
        pattern: String,
        /// Human readable reason
        reason: String,
    },

    /// The same parameter name is declared twice.
    #[error("invalid pattern {pattern:?}: duplicate parameter {name:?}")]
    DuplicateParam {
        /// The offending pattern
        pattern: String,
        /// The duplicated name
        name: String,
    },

    /// The pattern declares more parameters than a context can hold.
    #[error("invalid pattern {pattern:?}: {count} parameters exceed the limit of {max}")]
    TooManyParams {
        /// The offending pattern
        pattern: String,
        /// Number of parameters declared
        count: usize,
        /// The compile-time cap
        max: usize,
    },

    /// A parameter constraint is unknown or has bad arguments.
    #[error("invalid pattern {pattern:?}: bad constraint {constraint:?}: {reason}")]
    Constraint {
        /// The offending pattern
        pattern: String,
        /// The constraint text
        constraint: String,
        /// Human readable reason
        reason: String,
    },
}

impl PatternError {
    pub(crate) fn invalid(pattern: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(
        pattern: &str,
        constraint: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Constraint {
            pattern: pattern.to_string(),
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }

    /// Returns the pattern that failed to compile.
    #[must_use]
    pub fn pattern(&self) -> &str {
        match self {
            Self::Invalid { pattern, .. }
            | Self::DuplicateParam { pattern, .. }
            | Self::TooManyParams { pattern, .. }
            | Self::Constraint { pattern, .. } => pattern,
        }
    }
}

/// An error raised when a host pattern cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The pattern is empty after normalisation.
    #[error("invalid domain pattern: empty pattern")]
    Empty,

    /// A dot-delimited label is empty (`a..b`).
    #[error("invalid domain pattern {0:?}: empty label")]
    EmptyLabel(String),

    /// A parameter label has no name (`:.example.com`).
    #[error("invalid domain pattern {0:?}: parameter without a name")]
    EmptyParamName(String),

    /// The same parameter name appears twice.
    #[error("invalid domain pattern {pattern:?}: duplicate parameter {name:?}")]
    DuplicateParam {
        /// The offending pattern
        pattern: String,
        /// The duplicated name
        name: String,
    },
}
