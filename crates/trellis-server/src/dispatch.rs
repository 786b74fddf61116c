//! Request dispatch.
//!
//! One request goes through these steps:
//!
//! 1. Freeze the application if this is the first request.
//! 2. Read the body, bounded by `body_limit` and `read_timeout`.
//! 3. Take a context from the pool and bind it to the request.
//! 4. Run the `next` chain. An error goes to the error handler of the
//!    best-matching sub-application; if that fails too the client gets a
//!    bare `500`.
//! 5. Recover from handler panics through the recover hook, or drop the
//!    connection when there is none.
//! 6. Hand the response to the transport and return the context to the
//!    pool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use trellis_core::{empty, full, Body, BoxError, ConnectionHandle, Ctx, Error};

use crate::app::App;
use crate::connection::TrackedConnection;
use crate::error::{ServerError, ServerResult};

impl App {
    /// Serves one request.
    ///
    /// `conn` is the tracked connection the request arrived on, if any.
    /// Returns an error only when the application cannot be frozen or a
    /// handler panicked with no recover hook installed; the transport
    /// should then drop the connection.
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        conn: Option<Arc<TrackedConnection>>,
    ) -> ServerResult<Response<Body>>
    where
        B: hyper::body::Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let state = self.state()?;

        let (parts, body) = request.into_parts();
        let body = match self.read_body(body).await {
            Ok(body) => body,
            Err(status) => return Ok(plain(status)),
        };
        let request = Request::from_parts(parts, body);
        let head = request.method() == Method::HEAD;

        let pool = self.inner.pool.load_full();
        let mut ctx = pool.acquire();
        let remote = conn.as_ref().and_then(|c| c.peer_addr());
        let handle = conn.map(|c| c as Arc<dyn ConnectionHandle>);
        ctx.reset(state, request, handle, remote);

        let outcome = AssertUnwindSafe(run_chain(&mut ctx)).catch_unwind().await;
        let mut response = match outcome {
            Ok(Ok(())) => {
                let response = finish(&mut ctx, head);
                pool.release(ctx);
                response
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, path = %ctx.path(), "error handler failed");
                pool.release(ctx);
                plain(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let hook = self.inner.recover.read().clone();
                let Some(hook) = hook else {
                    tracing::error!(panic = %message, path = %ctx.path(), "handler panicked");
                    return Err(ServerError::HandlerPanic(message));
                };
                tracing::warn!(panic = %message, path = %ctx.path(), "handler panicked, recovering");
                ctx.reset_response();
                if let Err(err) = hook(&mut ctx, &message) {
                    if let Err(e) = ctx.next_with_error(err).await {
                        tracing::error!(error = %e, "error handler failed after panic");
                        return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR));
                    }
                }
                // A context that unwound mid-handler is not reused.
                finish(&mut ctx, head)
            }
        };

        if head {
            *response.body_mut() = empty();
        }
        Ok(response)
    }

    /// Serves `request` without a connection and returns the response.
    ///
    /// Meant for tests: the application is frozen on first use, exactly as
    /// for network requests.
    pub async fn test<B: Into<Bytes>>(&self, request: Request<B>) -> trellis_core::Result<Response<Body>> {
        let request = request.map(|body| Full::new(body.into()));
        self.handle(request, None).await.map_err(|e| match e {
            ServerError::Setup(e) => e,
            other => Error::internal_with_source("request failed", other),
        })
    }

    async fn read_body<B>(&self, body: B) -> Result<Bytes, StatusCode>
    where
        B: hyper::body::Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let limited = Limited::new(body, self.inner.config.body_limit());
        match tokio::time::timeout(self.inner.config.read_timeout(), limited.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::debug!(limit = self.inner.config.body_limit(), "request body too large");
                Err(StatusCode::PAYLOAD_TOO_LARGE)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "failed to read request body");
                Err(StatusCode::BAD_REQUEST)
            }
            Err(_) => {
                tracing::debug!("request body read timed out");
                Err(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }
}

async fn run_chain(ctx: &mut Ctx) -> trellis_core::Result<()> {
    match ctx.next().await {
        Ok(()) => Ok(()),
        Err(err) => ctx.next_with_error(err).await,
    }
}

/// Takes the response, keeping `Content-Length` for `HEAD`.
fn finish(ctx: &mut Ctx, head: bool) -> Response<Body> {
    let length = if head { ctx.response_body_bytes().map(|b| b.len()) } else { None };
    let mut response = ctx.take_response();
    if let Some(length) = length {
        response
            .headers_mut()
            .entry(header::CONTENT_LENGTH)
            .or_insert_with(|| HeaderValue::from(length));
    }
    response
}

fn plain(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(full(status.canonical_reason().unwrap_or_default()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
