//! The application.
//!
//! An [`App`] owns the registration list, the frozen request state, the
//! context pool, the hook table and the lifecycle controller. It is a
//! cheap handle: clones share everything.
//!
//! # Freezing
//!
//! Registrations are recorded in order. The first request (or the first
//! call to [`App::listen`]) expands mounts and builds the frozen
//! [`AppState`] exactly once. Later registrations are staged until
//! [`App::rebuild`] swaps in a new frozen state; requests already in
//! flight keep the generation they started with.
//!
//! ```text
//!   registrations: [GET /a, MOUNT /john -> B, USE /, ...]
//!        │ freeze / rebuild
//!        ▼
//!   RouterBuilder ── B's routes re-prefixed at the mount position
//!        │ build(radix)
//!        ▼
//!   ArcSwap<AppState> ── read lock-free by every request
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, RwLock};
use trellis_core::{
    error_handler, join_path, sort_scoped, AppState, BoxFuture, BoxedHandler, ContextFactory, Ctx,
    CtxPool, Error, ErrorHandler, RecoverHook, Result, Route, RouteInfo, Scoped, Settings, Slot,
    Views,
};
use trellis_router::{DomainPattern, PatternOptions, RouterBuilder};

use crate::config::AppConfig;
use crate::connection::{TrackedConnection, TransportConn};
use crate::error::{LifecycleResult, ShutdownError};
use crate::group::Group;
use crate::hooks::{Hooks, ListenData};
use crate::lifecycle::{Lifecycle, LifecycleState, ShutdownConfig, ShutdownContext};
use crate::registrar::{RouteHandle, Registrar};
use crate::telemetry::{ShutdownSnapshot, ShutdownTelemetry};

#[derive(Clone)]
enum Registration {
    Route(Arc<Route>),
    Mount { prefix: String, app: App },
}

/// A frozen generation: the request state plus the expanded route list.
pub(crate) struct Frozen {
    pub(crate) state: Arc<AppState>,
    routes: Vec<Arc<Route>>,
}

pub(crate) struct AppInner {
    pub(crate) config: AppConfig,
    settings: Settings,
    registrations: Mutex<Vec<Registration>>,
    frozen: ArcSwapOption<Frozen>,
    build_lock: Mutex<()>,
    pub(crate) hooks: RwLock<Hooks>,
    error_handler: RwLock<Option<ErrorHandler>>,
    views: RwLock<Option<Arc<dyn Views>>>,
    pub(crate) recover: RwLock<Option<RecoverHook>>,
    pub(crate) pool: ArcSwap<CtxPool>,
    pub(crate) lifecycle: Lifecycle,
    mount_path: RwLock<String>,
}

/// A Trellis application.
///
/// ```rust
/// use http::Request;
/// use trellis_server::{App, Registrar};
///
/// # tokio_test::block_on(async {
/// let app = App::default();
/// app.get("/hello/:name", |c| Box::pin(async move {
///     let body = format!("hello {}", c.param("name"));
///     c.send_string(body)
/// }))
/// .unwrap();
///
/// let response = app.test(Request::get("/hello/ada").body("").unwrap()).await.unwrap();
/// assert_eq!(response.status(), 200);
/// # });
/// ```
#[derive(Clone)]
pub struct App {
    pub(crate) inner: Arc<AppInner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.inner.config.app_name())
            .field("registrations", &self.inner.registrations.lock().len())
            .field("frozen", &self.inner.frozen.load().is_some())
            .field("lifecycle", &self.inner.lifecycle)
            .finish()
    }
}

impl App {
    /// Creates an application.
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let settings = config.settings();
        let pool = CtxPool::new(config.max_pooled_contexts());
        Self {
            inner: Arc::new(AppInner {
                settings,
                registrations: Mutex::new(Vec::new()),
                frozen: ArcSwapOption::empty(),
                build_lock: Mutex::new(()),
                hooks: RwLock::new(Hooks::default()),
                error_handler: RwLock::new(None),
                views: RwLock::new(None),
                recover: RwLock::new(None),
                pool: ArcSwap::from_pointee(pool),
                lifecycle: Lifecycle::new(),
                mount_path: RwLock::new(String::new()),
                config,
            }),
        }
    }

    /// The configuration the application was created with.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    fn options(&self) -> PatternOptions {
        self.inner.settings.pattern_options()
    }

    // ----------------------------------------------------------------
    // Registration
    // ----------------------------------------------------------------

    pub(crate) fn insert(
        &self,
        slots: &[Slot],
        path: &str,
        handlers: Vec<BoxedHandler>,
        domain: Option<&DomainPattern>,
        static_files: bool,
    ) -> Result<RouteHandle> {
        if handlers.is_empty() {
            return Err(Error::internal(format!("missing handler in route: {path}")));
        }
        let path = join_path("", path);
        let options = self.options();

        let routes = slots
            .iter()
            .map(|&slot| {
                Route::new(slot, path.clone(), handlers.clone(), options).map(|route| {
                    Arc::new(
                        route
                            .with_domain(domain.cloned())
                            .with_static_files(static_files),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let hooks = self.inner.hooks.read().clone();
        for route in &routes {
            hooks
                .run_route(&route.info())
                .map_err(|e| Error::internal_with_source("route hook failed", e))?;
        }

        let mut registrations = self.inner.registrations.lock();
        for route in &routes {
            tracing::debug!(method = route.slot().as_str(), path = %route.path(), "route registered");
            registrations.push(Registration::Route(Arc::clone(route)));
        }
        Ok(RouteHandle::new(routes))
    }

    /// A group of routes under `prefix`.
    #[must_use]
    pub fn group(&self, prefix: &str) -> Group {
        Group::new(self.clone(), join_path("", prefix), None)
    }

    /// A group under `prefix` whose middleware runs before every route in
    /// it.
    pub fn group_with(&self, prefix: &str, middleware: Vec<BoxedHandler>) -> Result<Group> {
        let group = self.group(prefix);
        group.route(&[Slot::Use], "/", middleware)?;
        Ok(group)
    }

    /// A router whose routes only match hosts matching `pattern`, such as
    /// `:user.blog.example.com`.
    pub fn domain(&self, pattern: &str) -> Result<Group> {
        let pattern = DomainPattern::parse(pattern)?;
        Ok(Group::new(self.clone(), String::new(), Some(pattern)))
    }

    /// Mounts `sub` under `prefix`.
    ///
    /// The sub-application's routes are re-prefixed and spliced in at this
    /// position when the application is frozen. Its mount hooks run now,
    /// with this application as the parent. Mounting an application into
    /// itself, directly or through other mounts, fails with
    /// [`Error::MountCycle`].
    pub fn mount(&self, prefix: &str, sub: &App) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &sub.inner) || sub.reaches(&self.inner, &mut Vec::new()) {
            return Err(Error::MountCycle(sub.inner.config.app_name().to_string()));
        }
        let prefix = join_path("", prefix);
        sub.set_mount_path(join_path(&self.mount_path(), &prefix));

        let hooks = sub.inner.hooks.read().clone();
        hooks
            .run_mount(self)
            .map_err(|e| Error::internal_with_source("mount hook failed", e))?;

        tracing::debug!(prefix = %prefix, app = sub.inner.config.app_name(), "application mounted");
        self.inner.registrations.lock().push(Registration::Mount {
            prefix,
            app: sub.clone(),
        });
        Ok(())
    }

    fn reaches(&self, target: &Arc<AppInner>, seen: &mut Vec<usize>) -> bool {
        let id = Arc::as_ptr(&self.inner) as usize;
        if seen.contains(&id) {
            return false;
        }
        seen.push(id);
        self.mounts()
            .iter()
            .any(|(_, app)| Arc::ptr_eq(&app.inner, target) || app.reaches(target, seen))
    }

    fn set_mount_path(&self, path: String) {
        for (prefix, app) in self.mounts() {
            app.set_mount_path(join_path(&path, &prefix));
        }
        *self.inner.mount_path.write() = path;
    }

    fn mounts(&self) -> Vec<(String, App)> {
        self.inner
            .registrations
            .lock()
            .iter()
            .filter_map(|r| match r {
                Registration::Mount { prefix, app } => Some((prefix.clone(), app.clone())),
                Registration::Route(_) => None,
            })
            .collect()
    }

    /// Path this application is mounted at, `""` for a root application.
    #[must_use]
    pub fn mount_path(&self) -> String {
        self.inner.mount_path.read().clone()
    }

    // ----------------------------------------------------------------
    // Freezing
    // ----------------------------------------------------------------

    pub(crate) fn frozen(&self) -> Result<Arc<Frozen>> {
        if let Some(frozen) = self.inner.frozen.load_full() {
            return Ok(frozen);
        }
        let _guard = self.inner.build_lock.lock();
        if let Some(frozen) = self.inner.frozen.load_full() {
            return Ok(frozen);
        }
        let frozen = Arc::new(self.build()?);
        self.inner.frozen.store(Some(Arc::clone(&frozen)));
        Ok(frozen)
    }

    pub(crate) fn state(&self) -> Result<Arc<AppState>> {
        self.frozen().map(|f| Arc::clone(&f.state))
    }

    /// Expands mounts and swaps in a new frozen state, picking up every
    /// registration made since the last freeze.
    pub fn rebuild(&self) -> Result<()> {
        let _guard = self.inner.build_lock.lock();
        let frozen = self.build()?;
        tracing::debug!(
            routes = frozen.state.router.route_count(),
            handlers = frozen.state.router.handler_count(),
            "registry rebuilt"
        );
        self.inner.frozen.store(Some(Arc::new(frozen)));
        Ok(())
    }

    fn build(&self) -> Result<Frozen> {
        let mut expansion = Expansion {
            options: self.options(),
            builder: RouterBuilder::new(),
            routes: Vec::new(),
            error_handlers: Vec::new(),
            views: Vec::new(),
            chain: Vec::new(),
        };
        expansion.expand(self, "")?;

        let router = expansion.builder.build(self.inner.config.radix_index());
        let mut state = AppState::new(router, self.inner.settings.clone());
        let default = std::mem::take(&mut state.error_handlers);
        state.error_handlers = expansion.error_handlers;
        state.error_handlers.extend(default);
        sort_scoped(&mut state.error_handlers);
        state.views = expansion.views;
        sort_scoped(&mut state.views);
        state.notice = Some(self.inner.lifecycle.notice());

        Ok(Frozen {
            state: Arc::new(state),
            routes: expansion.routes,
        })
    }

    // ----------------------------------------------------------------
    // Introspection
    // ----------------------------------------------------------------

    /// Number of handlers across all frozen routes, freezing the
    /// application if needed. Returns 0 when freezing fails.
    #[must_use]
    pub fn handlers_count(&self) -> usize {
        match self.state() {
            Ok(state) => state.router.handler_count(),
            Err(e) => {
                tracing::error!(error = %e, "failed to freeze application");
                0
            }
        }
    }

    /// Every frozen route in registration order, mounts expanded.
    pub fn routes(&self) -> Result<Vec<RouteInfo>> {
        Ok(self.frozen()?.routes.iter().map(|r| r.info()).collect())
    }

    // ----------------------------------------------------------------
    // Customisation
    // ----------------------------------------------------------------

    /// Replaces the error handler.
    ///
    /// When the application is mounted, requests under its mount path use
    /// this handler. Takes effect at the next freeze.
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: for<'a> Fn(&'a mut Ctx, Error) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(error_handler(f));
    }

    /// Installs the hook called when a handler panics.
    ///
    /// Without one, a panic closes the connection.
    pub fn set_recover_hook<F>(&self, f: F)
    where
        F: Fn(&mut Ctx, &str) -> Result<()> + Send + Sync + 'static,
    {
        *self.inner.recover.write() = Some(Arc::new(f));
    }

    /// Installs the template engine and loads its templates.
    pub fn set_views(&self, views: Arc<dyn Views>) -> Result<()> {
        views.load()?;
        *self.inner.views.write() = Some(views);
        Ok(())
    }

    /// Builds pooled contexts with `factory` from now on.
    pub fn set_context_factory<F>(&self, factory: F)
    where
        F: Fn() -> Ctx + Send + Sync + 'static,
    {
        let factory: ContextFactory = Arc::new(factory);
        self.inner.pool.store(Arc::new(CtxPool::with_factory(
            self.inner.config.max_pooled_contexts(),
            factory,
        )));
    }

    // ----------------------------------------------------------------
    // Hooks
    // ----------------------------------------------------------------

    /// Runs `hook` for every route registered from now on.
    pub fn on_route<F>(&self, hook: F)
    where
        F: Fn(&RouteInfo) -> LifecycleResult + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_route(hook);
    }

    /// Runs `hook` with the parent whenever this application is mounted.
    pub fn on_mount<F>(&self, hook: F)
    where
        F: Fn(&App) -> LifecycleResult + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_mount(hook);
    }

    /// Runs `hook` once the listener is bound.
    pub fn on_listen<F>(&self, hook: F)
    where
        F: Fn(&ListenData) -> LifecycleResult + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_listen(hook);
    }

    /// Runs `hook` after in-flight requests are notified of shutdown and
    /// before connections are drained.
    pub fn on_pre_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = LifecycleResult> + Send + 'static,
    {
        self.inner.hooks.write().on_pre_shutdown(hook);
    }

    /// Runs `hook` with the shutdown outcome once every connection is
    /// gone.
    pub fn on_post_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn(Option<ShutdownError>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = LifecycleResult> + Send + 'static,
    {
        self.inner.hooks.write().on_post_shutdown(hook);
    }

    pub(crate) fn listen_data(&self, addr: std::net::SocketAddr) -> ListenData {
        ListenData {
            addr,
            app_name: self.inner.config.app_name().to_string(),
        }
    }

    // ----------------------------------------------------------------
    // Connections and shutdown
    // ----------------------------------------------------------------

    /// Registers a connection that is served outside the built-in TCP
    /// listener.
    pub fn track_connection(&self, transport: Arc<dyn TransportConn>) -> Arc<TrackedConnection> {
        self.inner.lifecycle.track(transport)
    }

    /// The lifecycle controller.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// Live connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.inner.lifecycle.active_connections()
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lifecycle.is_shutting_down()
    }

    /// The record of the most recent shutdown.
    #[must_use]
    pub fn last_shutdown_telemetry(&self) -> Option<ShutdownTelemetry> {
        self.inner.lifecycle.last_telemetry()
    }

    /// Shuts down gracefully within the configured shutdown timeout.
    pub async fn shutdown(&self) -> std::result::Result<(), ShutdownError> {
        self.shutdown_with_timeout(self.inner.config.shutdown_timeout())
            .await
    }

    /// Shuts down gracefully within `timeout`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> std::result::Result<(), ShutdownError> {
        self.shutdown_with_config(&ShutdownContext::background(), ShutdownConfig::new().timeout(timeout))
            .await
    }

    /// Shuts down gracefully, bounded by `ctx`.
    pub async fn shutdown_with_context(&self, ctx: &ShutdownContext) -> std::result::Result<(), ShutdownError> {
        self.shutdown_with_config(ctx, ShutdownConfig::new()).await
    }

    /// Shuts down gracefully with explicit options.
    pub async fn shutdown_with_config(
        &self,
        ctx: &ShutdownContext,
        config: ShutdownConfig,
    ) -> std::result::Result<(), ShutdownError> {
        let hooks = self.inner.hooks.read().clone();
        self.inner.lifecycle.shutdown(ctx, &config, &hooks).await
    }

    /// A handler serving the shutdown status as JSON:
    /// `{"status": "running" | "shutdown", "activeConnections": n,
    /// "lastShutdown": {...} | null}`.
    #[must_use]
    pub fn shutdown_debug_handler(&self) -> BoxedHandler {
        let inner: Weak<AppInner> = Arc::downgrade(&self.inner);
        trellis_core::handler(move |c| {
            let inner = inner.upgrade();
            Box::pin(async move {
                let Some(inner) = inner else {
                    return Err(Error::status(http::StatusCode::SERVICE_UNAVAILABLE));
                };
                let lifecycle = &inner.lifecycle;
                let snapshot = ShutdownSnapshot {
                    status: if lifecycle.state() == LifecycleState::Running {
                        "running"
                    } else {
                        "shutdown"
                    },
                    active_connections: lifecycle.active_connections(),
                    last_shutdown: lifecycle.last_telemetry(),
                };
                c.json(&snapshot)
            })
        })
    }
}

impl Registrar for App {
    fn register(
        &self,
        slots: &[Slot],
        path: &str,
        handlers: Vec<BoxedHandler>,
        static_files: bool,
    ) -> Result<RouteHandle> {
        self.insert(slots, path, handlers, None, static_files)
    }
}

/// Mount expansion state.
struct Expansion {
    options: PatternOptions,
    builder: RouterBuilder<Route>,
    routes: Vec<Arc<Route>>,
    error_handlers: Scoped<ErrorHandler>,
    views: Scoped<Arc<dyn Views>>,
    chain: Vec<usize>,
}

impl Expansion {
    fn expand(&mut self, app: &App, prefix: &str) -> Result<()> {
        let id = Arc::as_ptr(&app.inner) as usize;
        if self.chain.contains(&id) {
            return Err(Error::MountCycle(app.inner.config.app_name().to_string()));
        }
        self.chain.push(id);

        if let Some(handler) = app.inner.error_handler.read().clone() {
            self.error_handlers.push((prefix.to_string(), handler));
        }
        if let Some(views) = app.inner.views.read().clone() {
            self.views.push((prefix.to_string(), views));
        }

        let registrations = app.inner.registrations.lock().clone();
        for registration in registrations {
            match registration {
                Registration::Route(route) => {
                    let route = if prefix.is_empty() {
                        route
                    } else {
                        Arc::new(route.prefixed(prefix, self.options)?)
                    };
                    self.builder.push(route.slot(), Arc::clone(&route));
                    self.routes.push(route);
                }
                Registration::Mount { prefix: sub_prefix, app: sub } => {
                    let full = if prefix.is_empty() {
                        sub_prefix
                    } else {
                        join_path(prefix, &sub_prefix)
                    };
                    self.expand(&sub, &full)?;
                }
            }
        }

        self.chain.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownConfig;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_handler() -> BoxedHandler {
        trellis_core::handler(|c| Box::pin(async move { c.send_string("ok") }))
    }

    async fn body_of(response: http::Response<trellis_core::Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_mount_prefixes_routes() {
        let sub = App::default();
        sub.get("/doe", |c| Box::pin(async move { c.send_string("doe") }))
            .unwrap();
        let app = App::default();
        app.mount("/john", &sub).unwrap();

        assert_eq!(sub.mount_path(), "/john");
        assert_eq!(app.handlers_count(), 1);
        let response = app
            .test(Request::get("/john/doe").body("").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "doe");
    }

    #[tokio::test]
    async fn test_nested_mounts_and_position() {
        let c = App::default();
        c.get("/x", |c| Box::pin(async move { c.send_string("c") }))
            .unwrap();
        let b = App::default();
        b.mount("/c", &c).unwrap();
        let a = App::default();
        a.get("/b/*", |c| Box::pin(async move { c.send_string("wildcard") }))
            .unwrap();
        a.mount("/b", &b).unwrap();

        assert_eq!(b.mount_path(), "/b");
        assert_eq!(c.mount_path(), "/b/c");
        let response = a.test(Request::get("/b/c/x").body("").unwrap()).await.unwrap();
        assert_eq!(body_of(response).await, "wildcard");

        let paths: Vec<String> = a.routes().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/b/*".to_string(), "/b/c/x".to_string()]);
    }

    #[test]
    fn test_mount_cycles_are_rejected() {
        let a = App::default();
        let b = App::default();
        assert!(matches!(a.mount("/a", &a), Err(Error::MountCycle(_))));
        a.mount("/b", &b).unwrap();
        assert!(matches!(b.mount("/a", &a), Err(Error::MountCycle(_))));
    }

    #[test]
    fn test_mount_hook_receives_parent() {
        let parent = App::new(AppConfig::builder().app_name("parent").build());
        let sub = App::default();
        let seen = Arc::new(Mutex::new(String::new()));
        let captured = Arc::clone(&seen);
        sub.on_mount(move |p| {
            *captured.lock() = p.config().app_name().to_string();
            Ok(())
        });
        parent.mount("/sub", &sub).unwrap();
        assert_eq!(*seen.lock(), "parent");
    }

    #[test]
    fn test_route_hook_runs_per_method() {
        let app = App::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        app.on_route(move |info| {
            assert_eq!(info.path, "/all");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        app.all("/all", |c| Box::pin(async move { c.send_string("all") }))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_failing_route_hook_aborts_registration() {
        let app = App::default();
        app.on_route(|_| Err(crate::error::LifecycleError::new("no")));
        assert!(app.route(&[Slot::Use], "/", vec![ok_handler()]).is_err());
        assert!(app.routes().unwrap().is_empty());
    }

    #[test]
    fn test_missing_handler_is_rejected() {
        let app = App::default();
        assert!(app.route(&[trellis_core::MethodKind::Get.into()], "/", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_staged_until_rebuild() {
        let app = App::default();
        app.get("/a", |c| Box::pin(async move { c.send_string("a") }))
            .unwrap();
        assert_eq!(app.handlers_count(), 1);

        app.get("/b", |c| Box::pin(async move { c.send_string("b") }))
            .unwrap();
        let response = app.test(Request::get("/b").body("").unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        app.rebuild().unwrap();
        let response = app.test(Request::get("/b").body("").unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.handlers_count(), 2);
    }

    #[tokio::test]
    async fn test_route_metadata_is_shared_with_mounts() {
        let sub = App::default();
        let handle = sub
            .get("/doe", |c| Box::pin(async move { c.send_string("doe") }))
            .unwrap();
        let app = App::default();
        app.mount("/john", &sub).unwrap();
        let _ = app.routes().unwrap();

        handle.name("doe").summary("Doe").tags(["people"]).deprecated(true);
        let info = app.routes().unwrap().remove(0);
        assert_eq!(info.meta.name, "doe");
        assert_eq!(info.meta.tags, vec!["people".to_string()]);
        assert!(info.meta.deprecated);
    }

    #[tokio::test]
    async fn test_sub_app_error_handler_is_scoped() {
        let sub = App::default();
        sub.set_error_handler(|c, err| {
            Box::pin(async move {
                c.status(err.status_code());
                c.send_string("sub error")
            })
        });
        let app = App::default();
        app.mount("/sub", &sub).unwrap();

        let response = app.test(Request::get("/sub/missing").body("").unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await, "sub error");

        let response = app.test(Request::get("/missing").body("").unwrap()).await.unwrap();
        assert_eq!(body_of(response).await, "Cannot GET /missing");
    }

    #[tokio::test]
    async fn test_debug_handler_reports_status() {
        let app = App::default();
        app.route(
            &[trellis_core::MethodKind::Get.into()],
            "/debug/shutdown",
            vec![app.shutdown_debug_handler()],
        )
        .unwrap();

        let response = app
            .test(Request::get("/debug/shutdown").body("").unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["activeConnections"], 0);
        assert!(json["lastShutdown"].is_null());

        app.shutdown_with_config(&ShutdownContext::background(), ShutdownConfig::new())
            .await
            .unwrap();
        let response = app
            .test(Request::get("/debug/shutdown").body("").unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(json["status"], "shutdown");
        assert_eq!(json["lastShutdown"]["timedOut"], false);
    }

    #[tokio::test]
    async fn test_repeated_shutdown_reports_not_running() {
        let app = App::default();
        assert!(!app.is_shutting_down());
        app.shutdown().await.unwrap();
        assert!(app.is_shutting_down());
        assert_eq!(app.shutdown().await, Err(ShutdownError::NotRunning));
        assert_eq!(app.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_context_factory_defaults() {
        #[derive(Clone)]
        struct Tenant(&'static str);

        let app = App::default();
        app.set_context_factory(|| Ctx::new().with_extension(Tenant("acme")));
        app.get("/", |c| {
            Box::pin(async move {
                let tenant = c.extension::<Tenant>().map_or("none", |t| t.0);
                c.send_string(tenant)
            })
        })
        .unwrap();
        let response = app.test(Request::get("/").body("").unwrap()).await.unwrap();
        assert_eq!(body_of(response).await, "acme");
    }
}
