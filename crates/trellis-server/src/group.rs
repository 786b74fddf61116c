//! Route groups and domain routers.
//!
//! A [`Group`] is a registration view onto its [`App`]: routes registered
//! through it land in the application's registry with the group prefix
//! joined in front and, for domain routers, the host pattern attached.
//!
//! ```rust
//! use trellis_server::{App, Registrar};
//!
//! let app = App::default();
//! let api = app.group("/api");
//! let v1 = api.group("/v1");
//! v1.get("/users", |c| Box::pin(async move { c.send_string("users") })).unwrap();
//!
//! assert_eq!(app.routes().unwrap()[0].path, "/api/v1/users");
//! ```

use std::fmt;

use trellis_core::{join_path, BoxedHandler, Result, Slot};
use trellis_router::DomainPattern;

use crate::app::App;
use crate::registrar::{RouteHandle, Registrar};

/// A prefix (and optionally a host pattern) applied to every route
/// registered through it.
#[derive(Clone)]
pub struct Group {
    app: App,
    prefix: String,
    domain: Option<DomainPattern>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("prefix", &self.prefix)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl Group {
    pub(crate) fn new(app: App, prefix: String, domain: Option<DomainPattern>) -> Self {
        Self { app, prefix, domain }
    }

    /// The group prefix, `""` for a bare domain router.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The host pattern routes are restricted to.
    #[must_use]
    pub fn domain(&self) -> Option<&DomainPattern> {
        self.domain.as_ref()
    }

    /// The application routes are registered into.
    #[must_use]
    pub fn app(&self) -> &App {
        &self.app
    }

    /// A nested group. The host pattern is inherited.
    #[must_use]
    pub fn group(&self, prefix: &str) -> Self {
        Self::new(
            self.app.clone(),
            join_path(&self.prefix, prefix),
            self.domain.clone(),
        )
    }

    /// A nested group whose middleware runs before every route in it.
    pub fn group_with(&self, prefix: &str, middleware: Vec<BoxedHandler>) -> Result<Self> {
        let group = self.group(prefix);
        group.route(&[Slot::Use], "/", middleware)?;
        Ok(group)
    }
}

impl Registrar for Group {
    fn register(
        &self,
        slots: &[Slot],
        path: &str,
        handlers: Vec<BoxedHandler>,
        static_files: bool,
    ) -> Result<RouteHandle> {
        let path = join_path(&self.prefix, path);
        self.app
            .insert(slots, &path, handlers, self.domain.as_ref(), static_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use trellis_core::{handler, MethodKind};

    async fn get(app: &App, host: &str, path: &str) -> (StatusCode, String) {
        let request = Request::get(path).header("host", host).body("").unwrap();
        let response = app.test(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_group_middleware_runs_first() {
        let app = App::default();
        let admin = app
            .group_with(
                "/admin",
                vec![handler(|c| {
                    Box::pin(async move {
                        c.set("x-admin", "1");
                        c.next().await
                    })
                })],
            )
            .unwrap();
        admin
            .get("/stats", |c| Box::pin(async move { c.send_string("stats") }))
            .unwrap();
        app.get("/public", |c| Box::pin(async move { c.send_string("public") }))
            .unwrap();

        let response = app
            .test(Request::get("/admin/stats").body("").unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()["x-admin"], "1");

        let response = app.test(Request::get("/public").body("").unwrap()).await.unwrap();
        assert!(response.headers().get("x-admin").is_none());
    }

    #[test]
    fn test_group_root_path_is_prefix() {
        let app = App::default();
        let api = app.group("/api/");
        api.route(&[MethodKind::Get.into()], "/", vec![handler(|c| Box::pin(async move { c.send_string("") }))])
            .unwrap();
        let paths: Vec<String> = app.routes().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/api".to_string()]);
    }

    #[tokio::test]
    async fn test_domain_router_captures_host_params() {
        let app = App::default();
        let blogs = app.domain(":user.blog.example.com").unwrap();
        blogs
            .get("/", |c| {
                Box::pin(async move {
                    let user = c.domain_param("user").to_string();
                    c.send_string(user)
                })
            })
            .unwrap();
        app.get("/", |c| Box::pin(async move { c.send_string("main") }))
            .unwrap();

        assert_eq!(get(&app, "ada.blog.example.com", "/").await.1, "ada");
        assert_eq!(get(&app, "Ada.Blog.Example.com:8080", "/").await.1, "ada");
        assert_eq!(get(&app, "example.com", "/").await.1, "main");
    }

    #[tokio::test]
    async fn test_domain_group_inherits_pattern() {
        let app = App::default();
        let api = app.domain("api.example.com").unwrap().group("/v1");
        api.get("/ping", |c| Box::pin(async move { c.send_string("pong") }))
            .unwrap();

        assert_eq!(get(&app, "api.example.com", "/v1/ping").await, (StatusCode::OK, "pong".into()));
        assert_eq!(get(&app, "www.example.com", "/v1/ping").await.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invalid_domain_pattern() {
        let app = App::default();
        assert!(app.domain("").is_err());
    }
}
