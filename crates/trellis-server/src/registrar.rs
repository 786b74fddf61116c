//! The registration surface shared by [`App`](crate::App) and
//! [`Group`](crate::Group).
//!
//! Every call compiles the pattern immediately, so an invalid pattern is
//! reported by the call that introduced it:
//!
//! ```rust
//! use trellis_server::{App, Registrar};
//!
//! let app = App::default();
//! app.get("/users/:id<int>", |c| Box::pin(async move {
//!     let id = c.param("id").to_string();
//!     c.send_string(id)
//! }))
//! .unwrap()
//! .name("user.show")
//! .tags(["users"]);
//!
//! assert!(app.get("/:a/:a", |c| Box::pin(async move { c.send_status(http::StatusCode::OK) })).is_err());
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use http::Method;
use trellis_core::{handler, BoxFuture, BoxedHandler, Ctx, Error, MethodKind, Result, Route, RouteInfo, Slot};

use crate::static_files::{StaticConfig, StaticHandler};

/// Routes produced by one registration call.
///
/// `ALL` and `static_files` produce one route per method; the metadata
/// setters apply to all of them.
#[derive(Debug, Clone)]
pub struct RouteHandle {
    routes: Vec<Arc<Route>>,
}

impl RouteHandle {
    pub(crate) fn new(routes: Vec<Arc<Route>>) -> Self {
        Self { routes }
    }

    /// The registered routes.
    #[must_use]
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Introspection records for the registered routes.
    #[must_use]
    pub fn info(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(|r| r.info()).collect()
    }

    /// Sets the route name.
    pub fn name(&self, name: impl Into<String>) -> &Self {
        let name = name.into();
        self.update(|m| m.name.clone_from(&name))
    }

    /// Sets the one-line summary.
    pub fn summary(&self, summary: impl Into<String>) -> &Self {
        let summary = summary.into();
        self.update(|m| m.summary.clone_from(&summary))
    }

    /// Sets the description.
    pub fn description(&self, description: impl Into<String>) -> &Self {
        let description = description.into();
        self.update(|m| m.description.clone_from(&description))
    }

    /// Replaces the tags.
    pub fn tags<I, S>(&self, tags: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.update(|m| m.tags.clone_from(&tags))
    }

    /// Marks the route as deprecated.
    pub fn deprecated(&self, deprecated: bool) -> &Self {
        self.update(|m| m.deprecated = deprecated)
    }

    /// Replaces the accepted request media types.
    pub fn consumes<I, S>(&self, types: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        self.update(|m| m.consumes.clone_from(&types))
    }

    /// Replaces the produced response media types.
    pub fn produces<I, S>(&self, types: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        self.update(|m| m.produces.clone_from(&types))
    }

    fn update(&self, f: impl Fn(&mut trellis_core::RouteMeta)) -> &Self {
        for route in &self.routes {
            route.update_meta(&f);
        }
        self
    }
}

/// Route registration.
///
/// Implementors provide [`register`](Self::register); everything else is
/// expressed in terms of it.
pub trait Registrar {
    /// Registers `handlers` under `path` in each of `slots`.
    fn register(
        &self,
        slots: &[Slot],
        path: &str,
        handlers: Vec<BoxedHandler>,
        static_files: bool,
    ) -> Result<RouteHandle>;

    /// Registers `handlers` under `path` in each of `slots`.
    fn route(&self, slots: &[Slot], path: &str, handlers: Vec<BoxedHandler>) -> Result<RouteHandle> {
        self.register(slots, path, handlers, false)
    }

    /// Registers a handler chain for explicit methods.
    ///
    /// Extension methods have no slot and are rejected.
    fn add(&self, methods: &[Method], path: &str, handlers: Vec<BoxedHandler>) -> Result<RouteHandle> {
        let slots = methods
            .iter()
            .map(|m| {
                MethodKind::from_method(m)
                    .map(Slot::from)
                    .ok_or_else(|| Error::internal(format!("unsupported method: {m}")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.route(&slots, path, handlers)
    }

    /// `GET`.
    fn get<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Get.into()], path, vec![handler(f)])
    }

    /// `HEAD`.
    fn head<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Head.into()], path, vec![handler(f)])
    }

    /// `POST`.
    fn post<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Post.into()], path, vec![handler(f)])
    }

    /// `PUT`.
    fn put<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Put.into()], path, vec![handler(f)])
    }

    /// `PATCH`.
    fn patch<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Patch.into()], path, vec![handler(f)])
    }

    /// `DELETE`.
    fn delete<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Delete.into()], path, vec![handler(f)])
    }

    /// `CONNECT`.
    fn connect<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Connect.into()], path, vec![handler(f)])
    }

    /// `OPTIONS`.
    fn options<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Options.into()], path, vec![handler(f)])
    }

    /// `TRACE`.
    fn trace<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[MethodKind::Trace.into()], path, vec![handler(f)])
    }

    /// Every canonical method, one route each.
    fn all<F>(&self, path: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        let slots: Vec<Slot> = MethodKind::ALL.into_iter().map(Slot::from).collect();
        self.route(&slots, path, vec![handler(f)])
    }

    /// Middleware for every path.
    fn use_handler<F>(&self, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[Slot::Use], "/", vec![handler(f)])
    }

    /// Middleware for paths under `prefix`.
    fn use_at<F>(&self, prefix: &str, f: F) -> Result<RouteHandle>
    where
        F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.route(&[Slot::Use], prefix, vec![handler(f)])
    }

    /// Serves files under `root` for `GET` and `HEAD` requests below
    /// `prefix`.
    fn static_files(
        &self,
        prefix: &str,
        root: impl Into<PathBuf>,
        config: StaticConfig,
    ) -> Result<RouteHandle>
    where
        Self: Sized,
    {
        let handler: BoxedHandler = Arc::new(StaticHandler::new(root, config));
        let path = trellis_core::join_path(prefix, "*");
        self.register(
            &[MethodKind::Get.into(), MethodKind::Head.into()],
            &path,
            vec![handler],
            true,
        )
    }
}
