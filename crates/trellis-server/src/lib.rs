//! # Trellis Server
//!
//! Application, dispatcher and graceful lifecycle for the Trellis web
//! framework.
//!
//! - [`App`] - Route registration, mounting, freezing and hooks
//! - [`Group`] - Prefixed and domain-restricted registration views
//! - [`Registrar`] - The registration surface shared by both
//! - [`Lifecycle`] - Connection tracking and the shutdown phases
//! - [`StaticHandler`] - Static file serving
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trellis_server::{App, Registrar, ShutdownConfig, ShutdownContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     trellis_server::init_logging(&trellis_server::LogConfig::default())?;
//!
//!     let app = App::default();
//!     app.get("/", |c| Box::pin(async move { c.send_string("hello") }))?;
//!
//!     let server = app.clone();
//!     tokio::spawn(async move { server.listen("0.0.0.0:3000".parse().unwrap()).await });
//!
//!     trellis_server::wait_for_os_signal().await?;
//!     let ctx = ShutdownContext::with_timeout(Duration::from_secs(30));
//!     app.shutdown_with_config(&ctx, ShutdownConfig::new().request_deadline(Duration::from_secs(5)))
//!         .await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

mod app;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
mod group;
pub mod hooks;
pub mod lifecycle;
pub mod logging;
mod registrar;
mod server;
pub mod shutdown;
pub mod static_files;
pub mod telemetry;

pub use app::App;
pub use config::{AppConfig, AppConfigBuilder};
pub use connection::{
    ConnectionRegistry, MemoryConn, TcpConn, TrackedConnection, TrackedIo, TransportConn,
};
pub use error::{ConfigError, LifecycleError, LifecycleResult, ServerError, ServerResult, ShutdownError};
pub use group::Group;
pub use hooks::{Hooks, ListenData};
pub use lifecycle::{
    Lifecycle, LifecycleState, ShutdownConfig, ShutdownContext, Stage, WEBSOCKET_CLOSE_FRAME,
};
pub use logging::{init_logging, LogConfig, LoggingError};
pub use registrar::{Registrar, RouteHandle};
pub use shutdown::wait_for_os_signal;
pub use static_files::{StaticConfig, StaticHandler};
pub use telemetry::{ShutdownSnapshot, ShutdownTelemetry};
