//! Routes as stored in the registry.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use trellis_router::{DomainPattern, PatternOptions, Routable, RoutePattern, Slot};

use crate::error::Result;
use crate::handler::BoxedHandler;

/// OpenAPI-style descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteMeta {
    /// Route name, used for introspection and URL building.
    pub name: String,
    /// One-line summary.
    pub summary: String,
    /// Longer description.
    pub description: String,
    /// Grouping tags.
    pub tags: Vec<String>,
    /// Marked as deprecated.
    pub deprecated: bool,
    /// Accepted request media types.
    pub consumes: Vec<String>,
    /// Produced response media types.
    pub produces: Vec<String>,
}

/// A compiled pattern bound to its handlers.
pub struct Route {
    slot: Slot,
    path: String,
    pattern: RoutePattern,
    handlers: Vec<BoxedHandler>,
    middleware: bool,
    static_files: bool,
    domain: Option<DomainPattern>,
    meta: Arc<RwLock<RouteMeta>>,
}

impl Route {
    /// Compiles `path` for `slot`. Routes in [`Slot::Use`] match by
    /// prefix.
    pub fn new(
        slot: Slot,
        path: impl Into<String>,
        handlers: Vec<BoxedHandler>,
        options: PatternOptions,
    ) -> Result<Self> {
        let path = path.into();
        let pattern = RoutePattern::compile(&path, options)?;
        Ok(Self {
            middleware: slot == Slot::Use,
            slot,
            path,
            pattern,
            handlers,
            static_files: false,
            domain: None,
            meta: Arc::new(RwLock::new(RouteMeta::default())),
        })
    }

    /// Restricts the route to hosts matching `domain`.
    #[must_use]
    pub fn with_domain(mut self, domain: Option<DomainPattern>) -> Self {
        self.domain = domain;
        self
    }

    /// Flags the route as a static-file route.
    #[must_use]
    pub fn with_static_files(mut self, static_files: bool) -> Self {
        self.static_files = static_files;
        self
    }

    /// Copies the route under `prefix`, recompiling the pattern with
    /// `options`. Handlers and metadata are shared.
    pub fn prefixed(&self, prefix: &str, options: PatternOptions) -> Result<Self> {
        let path = join_path(prefix, &self.path);
        let pattern = RoutePattern::compile(&path, options)?;
        Ok(Self {
            slot: self.slot,
            path,
            pattern,
            handlers: self.handlers.clone(),
            middleware: self.middleware,
            static_files: self.static_files,
            domain: self.domain.clone(),
            meta: Arc::clone(&self.meta),
        })
    }

    /// Method slot the route was registered in.
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Path as registered, prefixes included.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Compiled pattern.
    #[must_use]
    pub fn compiled(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Parameter names in positional order.
    #[must_use]
    pub fn params(&self) -> &[String] {
        self.pattern.param_names()
    }

    /// Bound handlers.
    #[must_use]
    pub fn handlers(&self) -> &[BoxedHandler] {
        &self.handlers
    }

    /// Whether this is `USE` middleware.
    #[must_use]
    pub fn is_use(&self) -> bool {
        self.middleware
    }

    /// Whether this route serves static files.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.static_files
    }

    /// Host restriction, if any.
    #[must_use]
    pub fn domain_pattern(&self) -> Option<&DomainPattern> {
        self.domain.as_ref()
    }

    /// Snapshot of the metadata.
    #[must_use]
    pub fn meta(&self) -> RouteMeta {
        self.meta.read().clone()
    }

    /// Updates the metadata in place.
    pub fn update_meta(&self, f: impl FnOnce(&mut RouteMeta)) {
        f(&mut self.meta.write());
    }

    /// Serializable summary of the route.
    #[must_use]
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            method: self.slot.as_str().to_string(),
            path: self.path.clone(),
            params: self.params().to_vec(),
            handlers: self.handlers.len(),
            domain: self.domain.as_ref().map(|d| d.fingerprint().to_string()),
            meta: self.meta(),
        }
    }
}

impl Routable for Route {
    fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    fn is_middleware(&self) -> bool {
        self.middleware
    }

    fn domain(&self) -> Option<&DomainPattern> {
        self.domain.as_ref()
    }

    fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.slot.as_str())
            .field("path", &self.path)
            .field("handlers", &self.handlers.len())
            .field("middleware", &self.middleware)
            .field("static", &self.static_files)
            .finish_non_exhaustive()
    }
}

/// Introspection view of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// Method name, or `USE`.
    pub method: String,
    /// Registered path.
    pub path: String,
    /// Parameter names.
    pub params: Vec<String>,
    /// Number of handlers.
    pub handlers: usize,
    /// Host pattern, if domain-bound.
    pub domain: Option<String>,
    /// Descriptive metadata.
    #[serde(flatten)]
    pub meta: RouteMeta,
}

/// Joins a prefix and a path, collapsing duplicate slashes at the seam.
///
/// ```
/// use trellis_core::join_path;
///
/// assert_eq!(join_path("/api/", "/users"), "/api/users");
/// assert_eq!(join_path("/api", ""), "/api");
/// assert_eq!(join_path("", "users"), "/users");
/// assert_eq!(join_path("/", "/"), "/");
/// ```
#[must_use]
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let joined = match (prefix.is_empty(), path.is_empty()) {
        (true, true) => return "/".to_string(),
        (true, false) => format!("/{path}"),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{path}"),
    };
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use trellis_router::MethodKind;

    fn noop() -> BoxedHandler {
        handler(|_c| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_use_slot_marks_middleware() {
        let opts = PatternOptions::default();
        let mw = Route::new(Slot::Use, "/api", vec![noop()], opts).unwrap();
        assert!(mw.is_use());
        assert!(mw.is_middleware());

        let get = Route::new(MethodKind::Get.into(), "/api/:id", vec![noop(), noop()], opts).unwrap();
        assert!(!get.is_use());
        assert_eq!(get.handler_count(), 2);
        assert_eq!(get.params(), ["id"]);
    }

    #[test]
    fn test_prefixed_recompiles() {
        let opts = PatternOptions::default();
        let route = Route::new(MethodKind::Get.into(), "/doe", vec![noop()], opts).unwrap();
        route.update_meta(|m| m.name = "doe".into());

        let mounted = route.prefixed("/john", opts).unwrap();
        assert_eq!(mounted.path(), "/john/doe");
        assert!(mounted.compiled().captures("/john/doe").is_some());
        assert_eq!(mounted.meta().name, "doe");

        route.update_meta(|m| m.summary = "shared".into());
        assert_eq!(mounted.meta().summary, "shared");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = Route::new(MethodKind::Get.into(), "/:a/:a", vec![], PatternOptions::default());
        assert!(err.is_err());
    }

    #[test]
    fn test_info_serializes_flat() {
        let route =
            Route::new(MethodKind::Post.into(), "/items", vec![noop()], PatternOptions::default())
                .unwrap();
        route.update_meta(|m| {
            m.summary = "create".into();
            m.tags = vec!["items".into()];
        });
        let json = serde_json::to_value(route.info()).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["summary"], "create");
        assert_eq!(json["tags"][0], "items");
    }

    #[test]
    fn test_join_path_collapses_slashes() {
        assert_eq!(join_path("/a//", "//b"), "/a/b");
        assert_eq!(join_path("a", "b"), "/a/b");
    }

    proptest::proptest! {
        #[test]
        fn prop_join_path_is_rooted(prefix in "[a-z/]{0,12}", path in "[a-z/]{0,12}") {
            let joined = join_path(&prefix, &path);
            proptest::prop_assert!(joined.starts_with('/'));
            let inner = prefix.trim_end_matches('/').contains("//")
                || path.trim_start_matches('/').contains("//");
            proptest::prop_assert!(inner || !joined.contains("//"));
        }
    }
}
