//! HTTP method ordinals.
//!
//! The registry keeps one route slot per canonical method, indexed by
//! [`MethodKind::index`], plus a trailing slot ([`USE_SLOT`]) for
//! prefix-matching middleware.

use std::fmt;

use http::Method;

/// Number of canonical methods.
pub const METHOD_COUNT: usize = 9;

/// Slot index reserved for `USE` middleware.
pub const USE_SLOT: usize = METHOD_COUNT;

/// A canonical HTTP method.
///
/// # Example
///
/// ```rust
/// use trellis_router::MethodKind;
/// use http::Method;
///
/// assert_eq!(MethodKind::from_method(&Method::PATCH), Some(MethodKind::Patch));
/// assert_eq!(MethodKind::Get.index(), 0);
/// assert_eq!(MethodKind::Head.as_str(), "HEAD");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodKind {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// CONNECT
    Connect,
    /// OPTIONS
    Options,
    /// TRACE
    Trace,
    /// PATCH
    Patch,
}

impl MethodKind {
    /// All canonical methods in ordinal order.
    pub const ALL: [Self; METHOD_COUNT] = [
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Connect,
        Self::Options,
        Self::Trace,
        Self::Patch,
    ];

    /// The slot ordinal.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Maps an [`http::Method`]; extension methods have no slot.
    #[must_use]
    pub fn from_method(method: &Method) -> Option<Self> {
        Some(match *method {
            Method::GET => Self::Get,
            Method::HEAD => Self::Head,
            Method::POST => Self::Post,
            Method::PUT => Self::Put,
            Method::DELETE => Self::Delete,
            Method::CONNECT => Self::Connect,
            Method::OPTIONS => Self::Options,
            Method::TRACE => Self::Trace,
            Method::PATCH => Self::Patch,
            _ => return None,
        })
    }

    /// Parses an upper-case method name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str().eq_ignore_ascii_case(name))
    }

    /// The upper-case method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
        }
    }

    /// Converts back into an [`http::Method`].
    #[must_use]
    pub fn to_method(self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Head => Method::HEAD,
            Self::Post => Method::POST,
            Self::Put => Method::PUT,
            Self::Delete => Method::DELETE,
            Self::Connect => Method::CONNECT,
            Self::Options => Method::OPTIONS,
            Self::Trace => Method::TRACE,
            Self::Patch => Method::PATCH,
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry slot a route is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// A concrete method slot.
    Method(MethodKind),
    /// The `USE` middleware slot.
    Use,
}

impl Slot {
    /// The slot ordinal, [`USE_SLOT`] for middleware.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Method(m) => m.index(),
            Self::Use => USE_SLOT,
        }
    }

    /// The display name, `USE` for middleware.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Method(m) => m.as_str(),
            Self::Use => "USE",
        }
    }
}

impl From<MethodKind> for Slot {
    fn from(method: MethodKind) -> Self {
        Self::Method(method)
    }
}
