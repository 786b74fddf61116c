//! Host patterns for domain-scoped routing.
//!
//! A domain pattern is a dot-delimited list of labels; each label is either
//! literal text or a named parameter (`:user.blog.example.com`). Matching
//! requires the same number of labels and is case-insensitive.

use crate::error::DomainError;
use crate::params::Params;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Label {
    Literal(String),
    Param(String),
}

/// A parsed host pattern.
///
/// # Example
///
/// ```rust
/// use trellis_router::{normalize_host, DomainPattern, Params};
///
/// let pattern = DomainPattern::parse(":user.blog.example.com").unwrap();
/// let host = normalize_host("John.Blog.Example.com:8080");
///
/// let mut params = Params::new();
/// assert!(pattern.capture(&host, &mut params));
/// assert_eq!(params.get("user"), Some("john"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPattern {
    fingerprint: String,
    labels: Vec<Label>,
    param_positions: Vec<usize>,
}

impl DomainPattern {
    /// Parses a host pattern.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError`] for empty patterns, empty labels, parameters
    /// without a name, or duplicate parameter names.
    pub fn parse(pattern: &str) -> Result<Self, DomainError> {
        let trimmed = strip_host(pattern);
        if trimmed.is_empty() {
            return Err(DomainError::Empty);
        }

        let mut labels = Vec::new();
        let mut param_positions = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        for (i, part) in trimmed.split('.').enumerate() {
            if part.is_empty() {
                return Err(DomainError::EmptyLabel(pattern.to_string()));
            }
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(DomainError::EmptyParamName(pattern.to_string()));
                }
                if names.contains(&name) {
                    return Err(DomainError::DuplicateParam {
                        pattern: pattern.to_string(),
                        name: name.to_string(),
                    });
                }
                names.push(name);
                param_positions.push(i);
                labels.push(Label::Param(name.to_string()));
            } else {
                labels.push(Label::Literal(part.to_ascii_lowercase()));
            }
        }

        // Parameter names keep their case; literals are folded.
        let fingerprint = labels
            .iter()
            .map(|label| match label {
                Label::Param(name) => format!(":{name}"),
                Label::Literal(text) => text.clone(),
            })
            .collect::<Vec<_>>()
            .join(".");

        Ok(Self {
            fingerprint,
            labels,
            param_positions,
        })
    }

    /// The normalised pattern text; equal patterns share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Total number of labels.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.labels.len()
    }

    /// Positions of the parameter labels.
    #[must_use]
    pub fn param_positions(&self) -> &[usize] {
        &self.param_positions
    }

    /// Whether this pattern has any parameter labels.
    #[must_use]
    pub fn has_params(&self) -> bool {
        !self.param_positions.is_empty()
    }

    /// Parameter names in positional order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().filter_map(|l| match l {
            Label::Param(name) => Some(name.as_str()),
            Label::Literal(_) => None,
        })
    }

    /// Matches an already normalised host (see [`normalize_host`]).
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let mut parts = host.split('.');
        for label in &self.labels {
            match (parts.next(), label) {
                (None | Some(""), _) => return false,
                (Some(part), Label::Literal(text)) if text != part => return false,
                _ => {}
            }
        }
        parts.next().is_none()
    }

    /// Matches `host` and appends the parameter captures to `params`.
    ///
    /// `params` is left untouched on a mismatch.
    pub fn capture(&self, host: &str, params: &mut Params) -> bool {
        if !self.matches(host) {
            return false;
        }
        for (part, label) in host.split('.').zip(&self.labels) {
            if let Label::Param(name) = label {
                params.insert(name.clone(), part);
            }
        }
        true
    }
}

/// Normalises a `Host` value: strips the port (bracketed IPv6 included),
/// drops a trailing dot and lower-cases the result.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    strip_host(host).to_ascii_lowercase()
}

/// Strips the port and a trailing dot, keeping the case.
fn strip_host(host: &str) -> &str {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(idx)
                if !host[..idx].contains(':')
                    && host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) =>
            {
                &host[..idx]
            }
            _ => host,
        }
    };
    without_port.strip_suffix('.').unwrap_or(without_port)
}
