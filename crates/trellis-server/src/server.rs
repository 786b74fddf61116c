//! The HTTP/1.1 transport.
//!
//! Each accepted connection is tracked with the lifecycle controller and
//! served by hyper on its own task. The accept loop and every connection
//! watch the lifecycle stage:
//!
//! - `Closing`: the accept loop stops and the listener is dropped.
//! - `Draining`: idle keep-alive connections close at once; busy ones
//!   close after their current response.
//! - A force-close by the controller ends the connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};

use crate::app::App;
use crate::connection::{TcpConn, TrackedConnection, TrackedIo, TransportConn};
use crate::error::{ServerError, ServerResult};
use crate::lifecycle::Stage;
use crate::shutdown::wait_for_os_signal;

impl App {
    /// Binds `addr` and serves until shutdown closes the listener.
    ///
    /// ```rust,no_run
    /// use trellis_server::{App, Registrar};
    ///
    /// # async fn run() -> Result<(), trellis_server::ServerError> {
    /// let app = App::default();
    /// app.get("/", |c| Box::pin(async move { c.send_string("hello") }))?;
    /// app.listen("0.0.0.0:3000".parse().unwrap()).await
    /// # }
    /// ```
    pub async fn listen(&self, addr: SocketAddr) -> ServerResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.listener(listener).await
    }

    /// Serves on an already bound listener.
    ///
    /// Validates the configuration, freezes the application and runs the
    /// listen hooks before the first accept. Returns once shutdown starts.
    pub async fn listener(&self, listener: TcpListener) -> ServerResult<()> {
        self.inner.config.validate()?;
        let addr = listener.local_addr()?;
        self.state()?;

        let hooks = self.inner.hooks.read().clone();
        hooks.run_listen(&self.listen_data(addr))?;

        tracing::info!(
            addr = %addr,
            app = self.inner.config.app_name(),
            handlers = self.handlers_count(),
            "listening"
        );

        let mut stage = self.inner.lifecycle.stage();
        loop {
            if *stage.borrow_and_update() >= Stage::Closing {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => self.accept(stream),
                    Err(e) => tracing::error!(error = %e, "failed to accept connection"),
                },
                changed = stage.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(addr = %addr, "listener closed");
        Ok(())
    }

    /// Serves until SIGINT or SIGTERM, then shuts down gracefully within
    /// the configured shutdown timeout.
    pub async fn listen_with_signals(&self, addr: SocketAddr) -> ServerResult<()> {
        tokio::select! {
            result = self.listen(addr) => return result,
            signal = wait_for_os_signal() => signal?,
        }
        self.shutdown().await?;
        Ok(())
    }

    /// Tracks `transport` and serves HTTP on it in a background task.
    pub fn serve_transport(&self, transport: Arc<dyn TransportConn>) -> Arc<TrackedConnection> {
        let conn = self.track_connection(transport);
        let app = self.clone();
        let task_conn = Arc::clone(&conn);
        tokio::spawn(async move { app.serve_connection(task_conn).await });
        conn
    }

    fn accept(&self, stream: TcpStream) {
        let transport = match TcpConn::new(stream) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "failed to set up connection");
                return;
            }
        };
        if let Err(e) = transport.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let conn = self.serve_transport(Arc::new(transport));
        tracing::debug!(conn_id = conn.id(), peer = ?conn.peer_addr(), "connection accepted");
    }

    async fn serve_connection(&self, conn: Arc<TrackedConnection>) {
        let app = self.clone();
        let service_conn = Arc::clone(&conn);
        let service = service_fn(move |request: Request<Incoming>| {
            let app = app.clone();
            let conn = Arc::clone(&service_conn);
            async move { app.handle(request, Some(conn)).await }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.inner.config.idle_timeout());
        let io = TokioIo::new(TrackedIo::new(Arc::clone(&conn)));
        let connection = builder.serve_connection(io, service).with_upgrades();
        tokio::pin!(connection);

        let mut stage = self.inner.lifecycle.stage();
        let mut draining = *stage.borrow_and_update() >= Stage::Draining;
        if draining {
            connection.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(conn_id = conn.id(), error = %e, "connection error");
                    }
                    break;
                }
                changed = stage.changed(), if !draining => {
                    if changed.is_err() || *stage.borrow_and_update() >= Stage::Draining {
                        connection.as_mut().graceful_shutdown();
                        draining = true;
                    }
                }
                () = conn.released() => break,
            }
        }
    }
}
