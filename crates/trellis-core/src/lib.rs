//! # Trellis Core
//!
//! Request-side types for the Trellis web framework.
//!
//! - [`Ctx`] - Pooled per-request context driving the `next` chain
//! - [`Route`] - A compiled pattern bound to its handlers
//! - [`AppState`] - Frozen registry and settings shared by every request
//! - [`Error`] - Error type flowing through handlers and the error handler
//! - [`Handler`] - Handler trait, with [`handler`] for closures
//! - [`Done`] - Shutdown-aware completion signal exposed by [`Ctx::done`]

#![forbid(unsafe_code)]

mod body;
pub mod conn;
mod context;
pub mod cookie;
mod error;
mod handler;
pub mod media;
pub mod multipart;
pub mod negotiate;
mod pool;
mod route;
pub mod signal;
pub mod sse;
mod state;
mod views;

pub use body::{empty, from_stream, full, Body, BoxError, ResponseBody};
pub use conn::{CleanupHook, ConnectionHandle, ConnectionKind, SseSink};
pub use context::Ctx;
pub use error::{Error, Result};
pub use handler::{
    boxed, default_error_handler, error_handler, handler, BoxFuture, BoxedHandler, ErrorHandler,
    Handler, RecoverHook,
};
pub use pool::{ContextFactory, CtxPool, DEFAULT_MAX_POOLED};
pub use route::{join_path, Route, RouteInfo, RouteMeta};
pub use signal::{notice_channel, Done, NoticeReceiver, NoticeSender, ShutdownNotice};
pub use sse::{SseEvent, SseSender};
pub use state::{scoped_lookup, sort_scoped, AppState, Scoped, Settings};
pub use views::Views;

pub use trellis_router::{MethodKind, PatternOptions, Slot};
