//! The frozen, per-generation application state shared by every request.
//!
//! The server builds a new [`AppState`] whenever the registry is
//! (re)built and swaps it in atomically; contexts hold an `Arc` to the
//! generation they were reset with.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use trellis_router::{PatternOptions, Router};

use crate::handler::{default_error_handler, ErrorHandler};
use crate::multipart::MultipartConfig;
use crate::route::Route;
use crate::signal::NoticeReceiver;
use crate::views::Views;

/// Request-handling settings derived from the application config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Application name, used in logs.
    pub app_name: String,
    /// Compare paths case-sensitively.
    pub case_sensitive: bool,
    /// Distinguish `/a` from `/a/`.
    pub strict_routing: bool,
    /// Percent-decode paths before matching.
    pub unescape_path: bool,
    /// Header carrying the client address behind a proxy.
    pub proxy_header: Option<String>,
    /// Only honour proxy headers from trusted peers.
    pub enable_trusted_proxy_check: bool,
    /// Peers whose proxy headers are honoured.
    pub trusted_proxies: Vec<IpAddr>,
    /// Multipart limits.
    pub multipart: MultipartConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            case_sensitive: false,
            strict_routing: false,
            unescape_path: false,
            proxy_header: None,
            enable_trusted_proxy_check: false,
            trusted_proxies: Vec::new(),
            multipart: MultipartConfig::default(),
        }
    }
}

impl Settings {
    /// Pattern options matching these settings.
    #[must_use]
    pub fn pattern_options(&self) -> PatternOptions {
        PatternOptions {
            case_sensitive: self.case_sensitive,
            strict: self.strict_routing,
        }
    }

    /// Whether proxy headers from `peer` may be trusted.
    #[must_use]
    pub fn trusts(&self, peer: Option<IpAddr>) -> bool {
        if !self.enable_trusted_proxy_check {
            return true;
        }
        peer.is_some_and(|ip| self.trusted_proxies.contains(&ip))
    }
}

/// A prefix-scoped value; the longest matching prefix wins.
pub type Scoped<T> = Vec<(String, T)>;

/// Everything a request needs from its application.
pub struct AppState {
    /// The frozen registry.
    pub router: Router<Route>,
    /// Request settings.
    pub settings: Settings,
    /// Error handlers by mount prefix, longest prefix first.
    pub error_handlers: Scoped<ErrorHandler>,
    /// View engines by mount prefix, longest prefix first.
    pub views: Scoped<Arc<dyn Views>>,
    /// Application-wide shutdown notice.
    pub notice: Option<NoticeReceiver>,
}

impl AppState {
    /// State with an empty registry and default settings.
    #[must_use]
    pub fn new(router: Router<Route>, settings: Settings) -> Self {
        Self {
            router,
            settings,
            error_handlers: vec![(String::new(), default_error_handler())],
            views: Vec::new(),
            notice: None,
        }
    }

    /// The error handler of the sub-application best matching `path`.
    #[must_use]
    pub fn error_handler_for(&self, path: &str) -> ErrorHandler {
        scoped_lookup(&self.error_handlers, path)
            .cloned()
            .unwrap_or_else(default_error_handler)
    }

    /// The view engine of the sub-application best matching `path`.
    #[must_use]
    pub fn views_for(&self, path: &str) -> Option<&Arc<dyn Views>> {
        scoped_lookup(&self.views, path)
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("router", &self.router)
            .field("settings", &self.settings)
            .field("error_handlers", &self.error_handlers.len())
            .field("views", &self.views.len())
            .finish_non_exhaustive()
    }
}

/// Finds the entry whose prefix is the longest one covering `path` at a
/// segment boundary. Entries must be sorted longest prefix first.
pub fn scoped_lookup<'a, T>(entries: &'a Scoped<T>, path: &str) -> Option<&'a T> {
    entries
        .iter()
        .find(|(prefix, _)| {
            let prefix = prefix.trim_end_matches('/');
            prefix.is_empty()
                || (path.starts_with(prefix)
                    && matches!(path.as_bytes().get(prefix.len()), None | Some(b'/')))
        })
        .map(|(_, value)| value)
}

/// Sorts scoped entries longest prefix first, keeping insertion order for
/// equal lengths.
pub fn sort_scoped<T>(entries: &mut Scoped<T>) {
    entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
}
