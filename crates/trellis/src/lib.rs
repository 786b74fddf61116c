//! # Trellis
//!
//! **Express-style HTTP framework core**
//!
//! Trellis provides:
//!
//! - **Path compiler** with parameters, optional segments, wildcards and
//!   typed constraints
//! - **Route registry** with per-method slots, prefix middleware, domain
//!   routing, groups and mounted sub-applications
//! - **Pooled request context** driving the `next` chain
//! - **Graceful lifecycle** that drains connections, closes WebSocket and
//!   SSE streams with typed frames and reports what happened
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trellis::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::default();
//!     app.use_handler(|c| Box::pin(async move {
//!         c.set("X-Powered-By", "trellis");
//!         c.next().await
//!     }))?;
//!     app.get("/users/:id<int>", |c| Box::pin(async move {
//!         let id = c.param("id").to_string();
//!         c.json(&serde_json::json!({ "id": id }))
//!     }))?;
//!
//!     let server = app.clone();
//!     tokio::spawn(async move { server.listen("0.0.0.0:3000".parse().unwrap()).await });
//!
//!     trellis::server::wait_for_os_signal().await?;
//!     app.shutdown_with_config(
//!         &ShutdownContext::with_timeout(Duration::from_secs(30)),
//!         ShutdownConfig::new().request_deadline(Duration::from_secs(5)),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! trellis-router   patterns, domains, radix index
//!       ↑
//! trellis-core     Ctx, Route, AppState, Error
//!       ↑
//! trellis-server   App, dispatcher, transport, lifecycle
//! ```

#![doc(html_root_url = "https://docs.rs/trellis/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Re-export request-side types
pub use trellis_core as core;

// Re-export the path compiler and route index
pub use trellis_router as router;

// Re-export application, transport and lifecycle types
pub use trellis_server as server;

/// Prelude module for convenient imports.
///
/// ```rust
/// use trellis::prelude::*;
///
/// let app = App::default();
/// app.get("/", |c| Box::pin(async move { c.send_string("hi") })).unwrap();
/// assert_eq!(app.handlers_count(), 1);
/// ```
pub mod prelude {
    pub use trellis_core::{
        boxed, error_handler, handler, BoxFuture, BoxedHandler, Ctx, Error, Handler, Result,
        SseEvent, Views,
    };

    pub use trellis_router::{DomainPattern, MethodKind, PatternOptions};

    pub use trellis_server::{
        App, AppConfig, Group, Registrar, RouteHandle, ShutdownConfig, ShutdownContext,
        ShutdownError, ShutdownTelemetry, StaticConfig,
    };
}
