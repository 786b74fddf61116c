//! Handler traits and callback types.
//!
//! A handler is anything that can be called with the request [`Ctx`] and
//! returns a boxed future. Closures go through [`handler`], which pins
//! down the higher-ranked signature so the future can borrow the context:
//!
//! ```rust
//! use trellis_core::{handler, BoxedHandler};
//!
//! let hello: BoxedHandler = handler(|c| Box::pin(async move { c.send_string("hello") }));
//! # drop(hello);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Ctx;
use crate::error::{Error, Result};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request handler or middleware.
///
/// Middleware calls [`Ctx::next`] to hand control to the next matching
/// handler; terminal handlers simply produce a response.
pub trait Handler: Send + Sync + 'static {
    /// Runs the handler against `ctx`.
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
        self(ctx)
    }
}

/// A shared, type-erased handler as stored on routes.
pub type BoxedHandler = Arc<dyn Handler>;

/// Erases a handler's type.
pub fn boxed<H: Handler>(handler: H) -> BoxedHandler {
    Arc::new(handler)
}

/// Turns a closure into a [`BoxedHandler`].
pub fn handler<F>(f: F) -> BoxedHandler
where
    F: for<'a> Fn(&'a mut Ctx) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Turns a closure into an [`ErrorHandler`].
pub fn error_handler<F>(f: F) -> ErrorHandler
where
    F: for<'a> Fn(&'a mut Ctx, Error) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The application error handler.
///
/// Receives the context and the error that ended the chain and is expected
/// to write a response. Returning an error makes the transport answer with
/// a bare `500`.
pub type ErrorHandler =
    Arc<dyn for<'a> Fn(&'a mut Ctx, Error) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Called with the panic message when a handler panics.
pub type RecoverHook = Arc<dyn Fn(&mut Ctx, &str) -> Result<()> + Send + Sync>;

/// The built-in error handler: status from [`Error::status_code`], body
/// from [`Error::message`] as plain text.
pub fn default_error_handler() -> ErrorHandler {
    error_handler(|ctx, err| {
        Box::pin(async move {
            ctx.reset_response();
            ctx.status(err.status_code());
            ctx.content_type("text/plain; charset=utf-8");
            ctx.send_string(err.message())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let h = handler(|c| Box::pin(async move { c.send_string("hi") }));
        let mut ctx = Ctx::new();
        h.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"hi"[..]));
    }

    struct Teapot;

    impl Handler for Teapot {
        fn call<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { ctx.send_status(StatusCode::IM_A_TEAPOT) })
        }
    }

    #[tokio::test]
    async fn test_struct_handler() {
        let h = boxed(Teapot);
        let mut ctx = Ctx::new();
        h.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(ctx.response_body_bytes().as_deref(), Some(&b"I'm a teapot"[..]));
    }

    #[tokio::test]
    async fn test_default_error_handler_writes_status_and_message() {
        let handler = default_error_handler();
        let mut ctx = Ctx::new();
        ctx.send_string("partial").unwrap();
        handler(&mut ctx, Error::not_found("Cannot GET /nope")).await.unwrap();
        assert_eq!(ctx.response_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ctx.response_body_bytes().as_deref(),
            Some(&b"Cannot GET /nope"[..])
        );
    }
}
