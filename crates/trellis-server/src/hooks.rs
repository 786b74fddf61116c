//! Application hooks.
//!
//! Hooks are stored as `(name, callback)` pairs and run in registration
//! order. Unnamed hooks get a positional name such as `pre_shutdown_0`.
//!
//! Route, mount and listen hooks abort the triggering operation on the
//! first error. Shutdown hooks never abort shutdown: failures are logged
//! and collected.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use trellis_core::{BoxFuture, RouteInfo};

use crate::app::App;
use crate::error::{LifecycleError, LifecycleResult, ShutdownError};

/// Called for every route registration.
pub type RouteHook = Arc<dyn Fn(&RouteInfo) -> LifecycleResult + Send + Sync>;

/// Called on the mounted application with its new parent.
pub type MountHook = Arc<dyn Fn(&App) -> LifecycleResult + Send + Sync>;

/// Called once the listener is bound, before the first accept.
pub type ListenHook = Arc<dyn Fn(&ListenData) -> LifecycleResult + Send + Sync>;

/// Runs after in-flight requests are notified, before draining.
pub type PreShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, LifecycleResult> + Send + Sync>;

/// Runs after every connection is gone, with the shutdown outcome.
pub type PostShutdownHook =
    Arc<dyn Fn(Option<ShutdownError>) -> BoxFuture<'static, LifecycleResult> + Send + Sync>;

/// What listen hooks are told about the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenData {
    /// Bound address.
    pub addr: SocketAddr,
    /// Application name.
    pub app_name: String,
}

/// The hook table of one application.
#[derive(Clone, Default)]
pub struct Hooks {
    route: Vec<(String, RouteHook)>,
    mount: Vec<(String, MountHook)>,
    listen: Vec<(String, ListenHook)>,
    pre_shutdown: Vec<(String, PreShutdownHook)>,
    post_shutdown: Vec<(String, PostShutdownHook)>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("route", &self.route.len())
            .field("mount", &self.mount.len())
            .field("listen", &self.listen.len())
            .field("pre_shutdown", &self.pre_shutdown.len())
            .field("post_shutdown", &self.post_shutdown.len())
            .finish()
    }
}

impl Hooks {
    /// Adds a route hook.
    pub fn on_route<F>(&mut self, hook: F)
    where
        F: Fn(&RouteInfo) -> LifecycleResult + Send + Sync + 'static,
    {
        let name = format!("route_{}", self.route.len());
        self.route.push((name, Arc::new(hook)));
    }

    /// Adds a mount hook.
    pub fn on_mount<F>(&mut self, hook: F)
    where
        F: Fn(&App) -> LifecycleResult + Send + Sync + 'static,
    {
        let name = format!("mount_{}", self.mount.len());
        self.mount.push((name, Arc::new(hook)));
    }

    /// Adds a listen hook.
    pub fn on_listen<F>(&mut self, hook: F)
    where
        F: Fn(&ListenData) -> LifecycleResult + Send + Sync + 'static,
    {
        let name = format!("listen_{}", self.listen.len());
        self.listen.push((name, Arc::new(hook)));
    }

    /// Adds a pre-shutdown hook.
    pub fn on_pre_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LifecycleResult> + Send + 'static,
    {
        let name = format!("pre_shutdown_{}", self.pre_shutdown.len());
        self.on_pre_shutdown_named(name, hook);
    }

    /// Adds a named pre-shutdown hook.
    pub fn on_pre_shutdown_named<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LifecycleResult> + Send + 'static,
    {
        let hook: PreShutdownHook = Arc::new(move || Box::pin(hook()));
        self.pre_shutdown.push((name.into(), hook));
    }

    /// Adds a post-shutdown hook.
    pub fn on_post_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Option<ShutdownError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LifecycleResult> + Send + 'static,
    {
        let name = format!("post_shutdown_{}", self.post_shutdown.len());
        self.on_post_shutdown_named(name, hook);
    }

    /// Adds a named post-shutdown hook.
    pub fn on_post_shutdown_named<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(Option<ShutdownError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LifecycleResult> + Send + 'static,
    {
        let hook: PostShutdownHook = Arc::new(move |err| Box::pin(hook(err)));
        self.post_shutdown.push((name.into(), hook));
    }

    /// Runs route hooks, stopping at the first failure.
    pub fn run_route(&self, info: &RouteInfo) -> LifecycleResult {
        run_sync(&self.route, |hook| hook(info))
    }

    /// Runs mount hooks, stopping at the first failure.
    pub fn run_mount(&self, parent: &App) -> LifecycleResult {
        run_sync(&self.mount, |hook| hook(parent))
    }

    /// Runs listen hooks, stopping at the first failure.
    pub fn run_listen(&self, data: &ListenData) -> LifecycleResult {
        run_sync(&self.listen, |hook| hook(data))
    }

    /// Runs every pre-shutdown hook and returns the failures.
    pub async fn run_pre_shutdown(&self) -> Vec<LifecycleError> {
        let mut errors = Vec::new();
        for (name, hook) in &self.pre_shutdown {
            tracing::debug!(hook = %name, "running pre-shutdown hook");
            if let Err(e) = hook().await {
                tracing::warn!(hook = %name, error = %e, "pre-shutdown hook failed");
                errors.push(LifecycleError::hook(name.clone(), e.to_string()));
            }
        }
        errors
    }

    /// Runs every post-shutdown hook with `outcome` and returns the
    /// failures.
    pub async fn run_post_shutdown(&self, outcome: Option<ShutdownError>) -> Vec<LifecycleError> {
        let mut errors = Vec::new();
        for (name, hook) in &self.post_shutdown {
            tracing::debug!(hook = %name, "running post-shutdown hook");
            if let Err(e) = hook(outcome).await {
                tracing::warn!(hook = %name, error = %e, "post-shutdown hook failed");
                errors.push(LifecycleError::hook(name.clone(), e.to_string()));
            }
        }
        errors
    }
}

fn run_sync<H>(hooks: &[(String, H)], call: impl Fn(&H) -> LifecycleResult) -> LifecycleResult {
    for (name, hook) in hooks {
        if let Err(e) = call(hook) {
            tracing::error!(hook = %name, error = %e, "hook failed");
            return Err(LifecycleError::hook(name.clone(), e.to_string()));
        }
    }
    Ok(())
}
