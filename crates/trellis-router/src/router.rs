//! The method-indexed route registry.
//!
//! Registration goes through a mutable [`RouterBuilder`], which keeps one
//! slot per HTTP method plus the `USE` slot and stamps every route with a
//! monotonically increasing position. [`RouterBuilder::build`] produces a
//! frozen [`Router`] whose per-method stacks already interleave the `USE`
//! middleware by position, so dispatch is a single ordered walk.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::DomainPattern;
use crate::method::{MethodKind, Slot, METHOD_COUNT, USE_SLOT};
use crate::node::{Candidates, RadixIndex};
use crate::params::ParamValues;
use crate::pattern::RoutePattern;

/// What the registry needs to know about a stored route.
pub trait Routable: Send + Sync {
    /// The compiled path pattern.
    fn pattern(&self) -> &RoutePattern;

    /// Whether the route is `USE` middleware (prefix match).
    fn is_middleware(&self) -> bool;

    /// The host pattern restricting this route, if any.
    fn domain(&self) -> Option<&DomainPattern>;

    /// Number of handlers bound to the route.
    fn handler_count(&self) -> usize {
        1
    }
}

/// A route as stored in a frozen stack.
pub struct Entry<R> {
    /// The route
    pub route: Arc<R>,
    /// Registration position
    pub position: u64,
    /// Index into [`Router::domains`], if domain-bound
    pub domain: Option<usize>,
}

impl<R> Clone for Entry<R> {
    fn clone(&self) -> Self {
        Self {
            route: Arc::clone(&self.route),
            position: self.position,
            domain: self.domain,
        }
    }
}

impl<R: Routable> Entry<R> {
    /// Matches this entry's pattern, by prefix for middleware.
    pub fn matches(&self, detection: &str, original: &str, values: &mut ParamValues) -> bool {
        if self.route.is_middleware() {
            self.route.pattern().match_prefix(detection, original, values)
        } else {
            self.route.pattern().match_path(detection, original, values)
        }
    }
}

/// Mutable registry used while routes are being registered.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use trellis_router::{
///     DomainPattern, MethodKind, PatternOptions, Routable, RoutePattern, RouterBuilder, Slot,
/// };
///
/// struct Named(RoutePattern, bool);
///
/// impl Routable for Named {
///     fn pattern(&self) -> &RoutePattern { &self.0 }
///     fn is_middleware(&self) -> bool { self.1 }
///     fn domain(&self) -> Option<&DomainPattern> { None }
/// }
///
/// let opts = PatternOptions::default();
/// let mut builder = RouterBuilder::new();
/// builder.push(Slot::Use, Arc::new(Named(RoutePattern::compile("/", opts).unwrap(), true)));
/// builder.push(
///     Slot::Method(MethodKind::Get),
///     Arc::new(Named(RoutePattern::compile("/users/:id", opts).unwrap(), false)),
/// );
///
/// let router = builder.build(false);
/// assert_eq!(router.stack(MethodKind::Get).len(), 2);
/// assert_eq!(router.stack(MethodKind::Post).len(), 1);
/// ```
pub struct RouterBuilder<R> {
    slots: Vec<Vec<(u64, Arc<R>)>>,
    next_position: u64,
}

impl<R> Default for RouterBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RouterBuilder<R> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..=USE_SLOT).map(|_| Vec::new()).collect(),
            next_position: 0,
        }
    }

    /// Appends `route` to `slot` and returns its registration position.
    pub fn push(&mut self, slot: Slot, route: Arc<R>) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.slots[slot.index()].push((position, route));
        position
    }

    /// Routes in `slot`, in registration order.
    pub fn slot(&self, slot: Slot) -> impl Iterator<Item = &Arc<R>> {
        self.slots[slot.index()].iter().map(|(_, r)| r)
    }

    /// Total number of entries across all slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Routable> RouterBuilder<R> {
    /// Freezes the registry.
    ///
    /// Each method stack is the merge of that method's slot with the `USE`
    /// slot, ordered by registration position. When `radix` is true every
    /// stack also gets a [`RadixIndex`] keyed by literal prefix.
    #[must_use]
    pub fn build(&self, radix: bool) -> Router<R> {
        let mut domains: Vec<DomainPattern> = Vec::new();
        let mut domain_index: HashMap<String, usize> = HashMap::new();
        let mut domain_routes: Vec<Vec<u64>> = Vec::new();

        let mut domain_of = |route: &R, position: u64| -> Option<usize> {
            let pattern = route.domain()?;
            let idx = *domain_index
                .entry(pattern.fingerprint().to_string())
                .or_insert_with(|| {
                    domains.push(pattern.clone());
                    domain_routes.push(Vec::new());
                    domains.len() - 1
                });
            if !domain_routes[idx].contains(&position) {
                domain_routes[idx].push(position);
            }
            Some(idx)
        };

        let middleware = &self.slots[USE_SLOT];
        let mut stacks: Vec<Vec<Entry<R>>> = Vec::with_capacity(METHOD_COUNT);
        for slot in &self.slots[..METHOD_COUNT] {
            let mut merged = Vec::with_capacity(slot.len() + middleware.len());
            let (mut a, mut b) = (slot.iter().peekable(), middleware.iter().peekable());
            loop {
                let take_slot = match (a.peek(), b.peek()) {
                    (Some((pa, _)), Some((pb, _))) => pa < pb,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                let next = if take_slot { a.next() } else { b.next() };
                if let Some((position, route)) = next {
                    merged.push(Entry {
                        domain: domain_of(&**route, *position),
                        route: Arc::clone(route),
                        position: *position,
                    });
                }
            }
            stacks.push(merged);
        }

        let indexes = radix.then(|| {
            stacks
                .iter()
                .map(|stack| {
                    let mut index = RadixIndex::new();
                    for (i, entry) in stack.iter().enumerate() {
                        index.insert(entry.route.pattern().literal_prefix(), i as u32);
                    }
                    index
                })
                .collect()
        });

        let route_count = self.len();
        let handler_count = self
            .slots
            .iter()
            .flatten()
            .map(|(_, r)| r.handler_count())
            .sum();

        Router {
            stacks,
            indexes,
            domains,
            domain_index,
            domain_routes,
            route_count,
            handler_count,
        }
    }
}

/// A frozen, method-indexed registry.
pub struct Router<R> {
    stacks: Vec<Vec<Entry<R>>>,
    indexes: Option<Vec<RadixIndex>>,
    domains: Vec<DomainPattern>,
    domain_index: HashMap<String, usize>,
    domain_routes: Vec<Vec<u64>>,
    route_count: usize,
    handler_count: usize,
}

impl<R> fmt::Debug for Router<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.route_count)
            .field("handlers", &self.handler_count)
            .field("domains", &self.domains.len())
            .field("radix", &self.indexes.is_some())
            .finish()
    }
}

impl<R: Routable> Router<R> {
    /// The merged stack for `method`.
    #[must_use]
    pub fn stack(&self, method: MethodKind) -> &[Entry<R>] {
        &self.stacks[method.index()]
    }

    /// Resolves the stack to dispatch on for one request: `HEAD` falls back
    /// to `GET` when no `HEAD` route (other than middleware) matches the
    /// path on this host.
    ///
    /// `domain_hits[i]` says whether the request host matched
    /// `domains()[i]`. `values` is scratch space and is left cleared.
    pub fn resolve(
        &self,
        method: MethodKind,
        domain_hits: &[bool],
        detection: &str,
        original: &str,
        values: &mut ParamValues,
    ) -> MethodKind {
        if method != MethodKind::Head {
            return method;
        }
        let found = self
            .first_terminal(MethodKind::Head, domain_hits, detection, original, values)
            .is_some();
        values.clear();
        if found {
            MethodKind::Head
        } else {
            MethodKind::Get
        }
    }

    fn first_terminal(
        &self,
        method: MethodKind,
        domain_hits: &[bool],
        detection: &str,
        original: &str,
        values: &mut ParamValues,
    ) -> Option<&Entry<R>> {
        let stack = self.stack(method);
        let accept = |e: &Entry<R>, values: &mut ParamValues| {
            !e.route.is_middleware()
                && e.domain.map_or(true, |d| domain_hits.get(d).copied().unwrap_or(false))
                && e.matches(detection, original, values)
        };

        let mut candidates = Candidates::new();
        if self.lookup(method, detection, &mut candidates) {
            candidates
                .iter()
                .map(|&i| &stack[i as usize])
                .find(|e| accept(e, values))
        } else {
            stack.iter().find(|e| accept(e, values))
        }
    }

    /// Fills `out` with candidate stack indices from the radix index.
    ///
    /// Returns false when no index was built; callers then walk the whole
    /// stack.
    pub fn lookup(&self, method: MethodKind, detection: &str, out: &mut Candidates) -> bool {
        match &self.indexes {
            Some(indexes) => {
                indexes[method.index()].lookup(detection, out);
                true
            }
            None => false,
        }
    }

    /// Whether a radix index was built.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.indexes.is_some()
    }

    /// The deduplicated domain patterns referenced by routes.
    #[must_use]
    pub fn domains(&self) -> &[DomainPattern] {
        &self.domains
    }

    /// Whether any route is domain-bound.
    #[must_use]
    pub fn has_domains(&self) -> bool {
        !self.domains.is_empty()
    }

    /// Registration positions of the routes bound to the domain with
    /// `fingerprint`.
    #[must_use]
    pub fn domain_routes(&self, fingerprint: &str) -> &[u64] {
        self.domain_index
            .get(fingerprint)
            .map_or(&[], |&i| self.domain_routes[i].as_slice())
    }

    /// Number of registered route entries (middleware included).
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.route_count
    }

    /// Number of handlers across all entries.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handler_count
    }

    /// Returns the first terminal route matching the request, ignoring
    /// middleware. Used for introspection and tests; dispatch walks the
    /// stack itself so middleware can run.
    pub fn find(
        &self,
        method: MethodKind,
        host: Option<&str>,
        detection: &str,
        original: &str,
        values: &mut ParamValues,
    ) -> Option<&Arc<R>> {
        let domain_hits: Vec<bool> = self
            .domains
            .iter()
            .map(|d| host.is_some_and(|h| d.matches(h)))
            .collect();
        let method = self.resolve(method, &domain_hits, detection, original, values);
        self.first_terminal(method, &domain_hits, detection, original, values)
            .map(|e| &e.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternOptions;

    struct TestRoute {
        id: &'static str,
        pattern: RoutePattern,
        middleware: bool,
        domain: Option<DomainPattern>,
    }

    impl Routable for TestRoute {
        fn pattern(&self) -> &RoutePattern {
            &self.pattern
        }
        fn is_middleware(&self) -> bool {
            self.middleware
        }
        fn domain(&self) -> Option<&DomainPattern> {
            self.domain.as_ref()
        }
    }

    fn route(id: &'static str, path: &str) -> Arc<TestRoute> {
        Arc::new(TestRoute {
            id,
            pattern: RoutePattern::compile(path, PatternOptions::default()).unwrap(),
            middleware: false,
            domain: None,
        })
    }

    fn middleware(id: &'static str, path: &str) -> Arc<TestRoute> {
        Arc::new(TestRoute {
            middleware: true,
            ..Arc::try_unwrap(route(id, path)).ok().unwrap()
        })
    }

    fn on_domain(id: &'static str, host: &str, path: &str) -> Arc<TestRoute> {
        Arc::new(TestRoute {
            domain: Some(DomainPattern::parse(host).unwrap()),
            ..Arc::try_unwrap(route(id, path)).ok().unwrap()
        })
    }

    fn find<'a>(router: &'a Router<TestRoute>, m: MethodKind, path: &str) -> Option<&'a str> {
        let mut values = ParamValues::new();
        router.find(m, None, path, path, &mut values).map(|r| r.id)
    }

    #[test]
    fn test_middleware_interleaves_by_position() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Use, middleware("m1", "/"));
        b.push(Slot::Method(MethodKind::Get), route("g1", "/a"));
        b.push(Slot::Use, middleware("m2", "/a"));
        b.push(Slot::Method(MethodKind::Get), route("g2", "/b"));

        let router = b.build(false);
        let ids: Vec<_> = router.stack(MethodKind::Get).iter().map(|e| e.route.id).collect();
        assert_eq!(ids, ["m1", "g1", "m2", "g2"]);
        let ids: Vec<_> = router.stack(MethodKind::Post).iter().map(|e| e.route.id).collect();
        assert_eq!(ids, ["m1", "m2"]);
        assert_eq!(router.route_count(), 4);
        assert_eq!(router.handler_count(), 4);
    }

    #[test]
    fn test_earliest_registration_wins() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Method(MethodKind::Get), route("param", "/users/:id"));
        b.push(Slot::Method(MethodKind::Get), route("static", "/users/me"));
        let router = b.build(false);
        assert_eq!(find(&router, MethodKind::Get, "/users/me"), Some("param"));
    }

    fn resolve(router: &Router<TestRoute>, path: &str) -> MethodKind {
        router.resolve(MethodKind::Head, &[], path, path, &mut ParamValues::new())
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Use, middleware("mw", "/"));
        b.push(Slot::Method(MethodKind::Get), route("get", "/x"));
        let router = b.build(false);
        assert_eq!(resolve(&router, "/x"), MethodKind::Get);
        assert_eq!(find(&router, MethodKind::Head, "/x"), Some("get"));

        let mut b = RouterBuilder::new();
        b.push(Slot::Method(MethodKind::Get), route("get", "/x"));
        b.push(Slot::Method(MethodKind::Head), route("head", "/x"));
        let router = b.build(false);
        assert_eq!(resolve(&router, "/x"), MethodKind::Head);
        assert_eq!(find(&router, MethodKind::Head, "/x"), Some("head"));
    }

    #[test]
    fn test_head_fallback_is_per_path() {
        for radix in [false, true] {
            let mut b = RouterBuilder::new();
            b.push(Slot::Method(MethodKind::Get), route("a", "/a"));
            b.push(Slot::Method(MethodKind::Head), route("head-b", "/b"));
            b.push(Slot::Method(MethodKind::Get), route("users", "/api/users"));
            b.push(Slot::Method(MethodKind::Head), route("assets", "/assets/*"));
            let router = b.build(radix);

            assert_eq!(resolve(&router, "/a"), MethodKind::Get);
            assert_eq!(find(&router, MethodKind::Head, "/a"), Some("a"));
            assert_eq!(find(&router, MethodKind::Head, "/b"), Some("head-b"));
            assert_eq!(find(&router, MethodKind::Head, "/api/users"), Some("users"));
            assert_eq!(find(&router, MethodKind::Head, "/assets/app.css"), Some("assets"));
            assert_eq!(find(&router, MethodKind::Head, "/missing"), None);
        }
    }

    #[test]
    fn test_head_fallback_respects_domain() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Method(MethodKind::Get), route("get", "/x"));
        b.push(Slot::Method(MethodKind::Head), on_domain("head", "api.example.com", "/x"));
        let router = b.build(false);

        let mut values = ParamValues::new();
        let on_api = router.find(MethodKind::Head, Some("api.example.com"), "/x", "/x", &mut values);
        assert_eq!(on_api.map(|r| r.id), Some("head"));
        let elsewhere = router.find(MethodKind::Head, Some("example.com"), "/x", "/x", &mut values);
        assert_eq!(elsewhere.map(|r| r.id), Some("get"));
    }

    #[test]
    fn test_radix_lookup_keeps_order() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Use, middleware("mw", "/api"));
        b.push(Slot::Method(MethodKind::Get), route("users", "/api/users/:id"));
        b.push(Slot::Method(MethodKind::Get), route("other", "/other"));
        b.push(Slot::Method(MethodKind::Get), route("any", "/*"));
        let router = b.build(true);
        assert!(router.is_indexed());

        let mut out = Candidates::new();
        assert!(router.lookup(MethodKind::Get, "/api/users/7", &mut out));
        let ids: Vec<_> = out
            .iter()
            .map(|&i| router.stack(MethodKind::Get)[i as usize].route.id)
            .collect();
        assert_eq!(ids, ["mw", "users", "any"]);
    }

    #[test]
    fn test_domain_table_is_deduplicated() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Method(MethodKind::Get), on_domain("a", "api.example.com", "/"));
        b.push(Slot::Method(MethodKind::Post), on_domain("b", "API.example.com.", "/"));
        b.push(Slot::Method(MethodKind::Get), route("plain", "/"));
        let router = b.build(false);

        assert_eq!(router.domains().len(), 1);
        assert_eq!(router.domain_routes("api.example.com"), [0, 1]);
        assert!(router.domain_routes("other.com").is_empty());

        let mut values = ParamValues::new();
        let hit = router.find(MethodKind::Get, Some("api.example.com"), "/", "/", &mut values);
        assert_eq!(hit.map(|r| r.id), Some("a"));
        let miss = router.find(MethodKind::Get, Some("www.example.com"), "/", "/", &mut values);
        assert_eq!(miss.map(|r| r.id), Some("plain"));
    }

    #[test]
    fn test_domain_routes_have_no_priority() {
        let mut b = RouterBuilder::new();
        b.push(Slot::Method(MethodKind::Get), route("plain", "/"));
        b.push(Slot::Method(MethodKind::Get), on_domain("bound", "api.example.com", "/"));
        let router = b.build(false);
        let mut values = ParamValues::new();
        let hit = router.find(MethodKind::Get, Some("api.example.com"), "/", "/", &mut values);
        assert_eq!(hit.map(|r| r.id), Some("plain"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_first_matching_registration_wins(order in proptest::sample::subsequence(vec![0usize, 1, 2, 3], 1..=4)) {
                let patterns = ["/items/:id", "/items/*", "/items/42", "/:any/:id"];
                let ids = ["param", "wild", "exact", "generic"];
                let mut b = RouterBuilder::new();
                for &i in &order {
                    b.push(Slot::Method(MethodKind::Get), route(ids[i], patterns[i]));
                }
                let router = b.build(order.len() % 2 == 0);
                let expected = order.first().map(|&i| ids[i]);
                prop_assert_eq!(find(&router, MethodKind::Get, "/items/42"), expected);
            }
        }
    }
}
