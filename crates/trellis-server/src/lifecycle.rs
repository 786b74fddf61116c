//! Graceful shutdown.
//!
//! [`Lifecycle`] owns the `running → shutting-down → stopped` state
//! machine, the connection registry and the request-level shutdown
//! notice. [`Lifecycle::shutdown`] runs nine ordered phases:
//!
//! 1. mark shutting down and stop accepting,
//! 2. notify in-flight requests (their `done()` completes, `err()` turns
//!    into `RequestShutdown`, the request deadline is propagated),
//! 3. `on_shutdown_start(active)`,
//! 4. pre-shutdown hooks,
//! 5. drain plain connections, polling every `drain_interval`,
//! 6. close WebSocket and SSE connections with a protocol close,
//! 7. force-close whatever is left,
//! 8. post-shutdown hooks with the outcome,
//! 9. record [`ShutdownTelemetry`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use trellis_core::sse::SseFrame;
use trellis_core::{notice_channel, ConnectionKind, NoticeReceiver, NoticeSender, ShutdownNotice};

use crate::connection::{ConnectionRegistry, TrackedConnection, TransportConn};
use crate::error::ShutdownError;
use crate::hooks::Hooks;
use crate::telemetry::{format_duration, ShutdownTelemetry};

/// Default drain poll interval.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Default wait for a WebSocket peer to answer the close frame.
pub const DEFAULT_WEBSOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for an SSE stream to finish after the shutdown event.
pub const DEFAULT_SSE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 6455 close frame with status 1001 (going away).
pub const WEBSOCKET_CLOSE_FRAME: [u8; 4] = [0x88, 0x02, 0x03, 0xE9];

/// Event written to SSE streams on shutdown.
pub const DEFAULT_SSE_CLOSE_EVENT: &[u8] = trellis_core::sse::DEFAULT_SHUTDOWN_EVENT;

/// Cancellation and deadline for a shutdown call.
///
/// ```rust
/// use std::time::Duration;
/// use trellis_server::{ShutdownContext, ShutdownError};
///
/// let ctx = ShutdownContext::with_timeout(Duration::from_secs(5));
/// assert!(ctx.err().is_none());
/// ctx.cancel();
/// assert_eq!(ctx.err(), Some(ShutdownError::Canceled));
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    deadline: Option<Instant>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownContext {
    fn default() -> Self {
        Self::background()
    }
}

impl ShutdownContext {
    /// No deadline, not cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: Arc::new(watch::channel(false).0),
        }
    }

    /// Expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Expires at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::background()
        }
    }

    /// A child sharing this context's cancellation, expiring at the
    /// earlier of the two deadlines.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            deadline: earliest(self.deadline, Some(Instant::now() + timeout)),
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Cancels the context and every child.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Completes once the context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Completes once the context is cancelled or expired.
    pub async fn done(&self) {
        tokio::select! {
            () = self.cancelled() => {}
            () = sleep_until(self.deadline) => {}
        }
    }

    /// `Canceled`, `DeadlineExceeded` or `None`.
    #[must_use]
    pub fn err(&self) -> Option<ShutdownError> {
        if self.is_cancelled() {
            Some(ShutdownError::Canceled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ShutdownError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Callback with the active connection count.
pub type CountCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Callback with the remaining connection count and the drain time so far.
pub type DrainCallback = Arc<dyn Fn(usize, Duration) + Send + Sync>;

/// Callback with a connection id and the close outcome.
pub type CloseCallback = Arc<dyn Fn(u64, Option<ShutdownError>) + Send + Sync>;

/// Options for one shutdown call.
///
/// ```rust
/// use std::time::Duration;
/// use trellis_server::ShutdownConfig;
///
/// let config = ShutdownConfig::new()
///     .timeout(Duration::from_secs(10))
///     .drain_interval(Duration::from_millis(100))
///     .on_force_close(|n| eprintln!("force-closing {n} connections"));
/// assert_eq!(config.get_drain_interval(), Duration::from_millis(100));
/// ```
#[derive(Clone)]
pub struct ShutdownConfig {
    drain_interval: Duration,
    timeout: Option<Duration>,
    request_deadline: Option<Duration>,
    request_context: Option<ShutdownContext>,
    websocket_close_timeout: Duration,
    sse_close_timeout: Duration,
    sse_close_event: Bytes,
    on_shutdown_start: Option<CountCallback>,
    on_drain_progress: Option<DrainCallback>,
    on_force_close: Option<CountCallback>,
    on_websocket_close: Option<CloseCallback>,
    on_sse_close: Option<CloseCallback>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownConfig {
    /// Defaults: 500 ms drain interval, no timeout, 5 s protocol close
    /// timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            timeout: None,
            request_deadline: None,
            request_context: None,
            websocket_close_timeout: DEFAULT_WEBSOCKET_CLOSE_TIMEOUT,
            sse_close_timeout: DEFAULT_SSE_CLOSE_TIMEOUT,
            sse_close_event: Bytes::from_static(DEFAULT_SSE_CLOSE_EVENT),
            on_shutdown_start: None,
            on_drain_progress: None,
            on_force_close: None,
            on_websocket_close: None,
            on_sse_close: None,
        }
    }

    /// Sets the drain poll interval.
    #[must_use]
    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Bounds the whole shutdown.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Gives in-flight requests a deadline this far after shutdown
    /// starts.
    #[must_use]
    pub fn request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    /// Propagates `ctx`'s deadline to in-flight requests.
    #[must_use]
    pub fn request_context(mut self, ctx: ShutdownContext) -> Self {
        self.request_context = Some(ctx);
        self
    }

    /// Sets the WebSocket close wait.
    #[must_use]
    pub fn websocket_close_timeout(mut self, timeout: Duration) -> Self {
        self.websocket_close_timeout = timeout;
        self
    }

    /// Sets the SSE close wait.
    #[must_use]
    pub fn sse_close_timeout(mut self, timeout: Duration) -> Self {
        self.sse_close_timeout = timeout;
        self
    }

    /// Replaces the SSE shutdown event.
    #[must_use]
    pub fn sse_close_event(mut self, event: impl Into<Bytes>) -> Self {
        self.sse_close_event = event.into();
        self
    }

    /// Called once with the active connection count.
    #[must_use]
    pub fn on_shutdown_start(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_shutdown_start = Some(Arc::new(f));
        self
    }

    /// Called on every drain tick.
    #[must_use]
    pub fn on_drain_progress(mut self, f: impl Fn(usize, Duration) + Send + Sync + 'static) -> Self {
        self.on_drain_progress = Some(Arc::new(f));
        self
    }

    /// Called before connections are force-closed.
    #[must_use]
    pub fn on_force_close(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_force_close = Some(Arc::new(f));
        self
    }

    /// Called after each WebSocket close attempt.
    #[must_use]
    pub fn on_websocket_close(
        mut self,
        f: impl Fn(u64, Option<ShutdownError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_websocket_close = Some(Arc::new(f));
        self
    }

    /// Called after each SSE close attempt.
    #[must_use]
    pub fn on_sse_close(
        mut self,
        f: impl Fn(u64, Option<ShutdownError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_sse_close = Some(Arc::new(f));
        self
    }

    /// Drain poll interval.
    #[must_use]
    pub fn get_drain_interval(&self) -> Duration {
        self.drain_interval
    }

    /// Overall timeout.
    #[must_use]
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether a timeout has been set.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }
}

impl fmt::Debug for ShutdownConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownConfig")
            .field("drain_interval", &self.drain_interval)
            .field("timeout", &self.timeout)
            .field("request_deadline", &self.request_deadline)
            .field("websocket_close_timeout", &self.websocket_close_timeout)
            .field("sse_close_timeout", &self.sse_close_timeout)
            .finish_non_exhaustive()
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Serving requests.
    Running,
    /// A shutdown call is in progress.
    ShuttingDown,
    /// Shutdown finished.
    Stopped,
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const STOPPED: u8 = 2;

/// How far the transport should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Accepting and serving.
    Serving,
    /// Listeners stop accepting.
    Closing,
    /// Connections finish their current request and close.
    Draining,
    /// Everything is closed.
    Stopped,
}

/// Run/shutdown state machine of one application.
pub struct Lifecycle {
    state: AtomicU8,
    registry: ConnectionRegistry,
    notice: NoticeSender,
    stage: watch::Sender<Stage>,
    last: RwLock<Option<ShutdownTelemetry>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("active", &self.registry.active())
            .finish()
    }
}

impl Lifecycle {
    /// A running lifecycle with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            registry: ConnectionRegistry::new(),
            notice: notice_channel().0,
            stage: watch::channel(Stage::Serving).0,
            last: RwLock::new(None),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => LifecycleState::Running,
            SHUTTING_DOWN => LifecycleState::ShuttingDown,
            _ => LifecycleState::Stopped,
        }
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state() != LifecycleState::Running
    }

    /// Live connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.registry.active()
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Registers a connection.
    pub fn track(&self, transport: Arc<dyn TransportConn>) -> Arc<TrackedConnection> {
        self.registry.track(transport)
    }

    /// A receiver for the request-level shutdown notice.
    #[must_use]
    pub fn notice(&self) -> NoticeReceiver {
        self.notice.subscribe()
    }

    /// A receiver for the transport stage.
    #[must_use]
    pub fn stage(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    /// The most recent shutdown record.
    #[must_use]
    pub fn last_telemetry(&self) -> Option<ShutdownTelemetry> {
        self.last.read().clone()
    }

    /// Runs the shutdown phases.
    ///
    /// A call made while another is in progress returns `Ok(())` at once;
    /// a call after shutdown completed returns
    /// [`ShutdownError::NotRunning`].
    pub async fn shutdown(
        &self,
        ctx: &ShutdownContext,
        config: &ShutdownConfig,
        hooks: &Hooks,
    ) -> Result<(), ShutdownError> {
        match self.state.compare_exchange(
            RUNNING,
            SHUTTING_DOWN,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(SHUTTING_DOWN) => {
                tracing::debug!("shutdown already in progress");
                return Ok(());
            }
            Err(_) => return Err(ShutdownError::NotRunning),
        }

        let started = Instant::now();
        let started_at = Utc::now();
        self.stage.send_replace(Stage::Closing);
        let deadline = earliest(ctx.deadline(), config.timeout.map(|t| started + t));
        tracing::info!(
            active = self.registry.active(),
            timeout = ?deadline.map(|d| format_duration(d.saturating_duration_since(started))),
            "shutdown started"
        );

        let request_deadline = earliest(
            config.request_context.as_ref().and_then(ShutdownContext::deadline),
            config.request_deadline.map(|d| started + d),
        );
        self.notice.send_replace(ShutdownNotice {
            fired: true,
            deadline: request_deadline,
        });

        let initial = self.registry.active();
        if let Some(callback) = &config.on_shutdown_start {
            callback(initial);
        }

        let phase = Instant::now();
        hooks.run_pre_shutdown().await;
        let pre_hooks_duration = phase.elapsed();

        let phase = Instant::now();
        self.stage.send_replace(Stage::Draining);
        let outcome = self.drain(ctx, config, deadline, phase).await;
        let drain_duration = phase.elapsed();
        tracing::info!(
            duration = %format_duration(drain_duration),
            remaining = self.registry.active(),
            outcome = ?outcome,
            "drain finished"
        );

        let phase = Instant::now();
        let (web_sockets_closed, sses_closed) = if outcome.is_none() {
            self.close_streams(config, deadline).await
        } else {
            (0, 0)
        };
        let graceful_close_duration = phase.elapsed();

        let forced = self.registry.active();
        if forced > 0 {
            tracing::warn!(remaining = forced, "force-closing connections");
            if let Some(callback) = &config.on_force_close {
                callback(forced);
            }
            for conn in self.registry.snapshot() {
                conn.close();
            }
        }

        let phase = Instant::now();
        hooks.run_post_shutdown(outcome).await;
        let post_hooks_duration = phase.elapsed();

        self.state.store(STOPPED, Ordering::Release);
        self.stage.send_replace(Stage::Stopped);

        let telemetry = ShutdownTelemetry {
            started_at,
            completed_at: Utc::now(),
            total_duration: started.elapsed(),
            drain_duration,
            pre_hooks_duration,
            graceful_close_duration,
            post_hooks_duration,
            initial_conns: initial.max(forced),
            drained_conns: initial.saturating_sub(forced),
            forced_conns: forced,
            web_sockets_closed,
            sses_closed,
            timed_out: outcome == Some(ShutdownError::DeadlineExceeded),
        };
        tracing::info!(
            duration = %format_duration(telemetry.total_duration),
            drained = telemetry.drained_conns,
            forced = telemetry.forced_conns,
            timed_out = telemetry.timed_out,
            "shutdown complete"
        );
        *self.last.write() = Some(telemetry);

        outcome.map_or(Ok(()), Err)
    }

    async fn drain(
        &self,
        ctx: &ShutdownContext,
        config: &ShutdownConfig,
        deadline: Option<Instant>,
        started: Instant,
    ) -> Option<ShutdownError> {
        let mut ticker = tokio::time::interval(config.drain_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if self.registry.count(ConnectionKind::Plain) == 0 {
                return None;
            }
            if let Some(err) = ctx.err() {
                return Some(err);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Some(ShutdownError::DeadlineExceeded);
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let remaining = self.registry.active();
                    let elapsed = started.elapsed();
                    tracing::debug!(remaining, elapsed_ms = elapsed.as_millis() as u64, "draining");
                    if let Some(callback) = &config.on_drain_progress {
                        callback(remaining, elapsed);
                    }
                }
                () = ctx.cancelled() => {}
                () = sleep_until(deadline) => {}
                () = self.registry.changed() => {}
            }
        }
    }

    async fn close_streams(&self, config: &ShutdownConfig, deadline: Option<Instant>) -> (usize, usize) {
        let streams = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| conn.kind() != ConnectionKind::Plain);

        let closes = streams.map(|conn| async move {
            let kind = conn.kind();
            let result = match kind {
                ConnectionKind::WebSocket => {
                    let result =
                        close_websocket(&conn, bounded(config.websocket_close_timeout, deadline))
                            .await;
                    if let Some(callback) = &config.on_websocket_close {
                        callback(conn.id(), result.err());
                    }
                    result
                }
                _ => {
                    let result = close_sse(
                        &conn,
                        &config.sse_close_event,
                        bounded(config.sse_close_timeout, deadline),
                    )
                    .await;
                    if let Some(callback) = &config.on_sse_close {
                        callback(conn.id(), result.err());
                    }
                    result
                }
            };
            (kind, result.is_ok())
        });

        let results = futures_util::future::join_all(closes).await;
        let count = |kind| results.iter().filter(|r| **r == (kind, true)).count();
        (count(ConnectionKind::WebSocket), count(ConnectionKind::Sse))
    }
}

/// Sends the close frame (or runs the cleanup hook) and waits for the
/// peer's answer.
async fn close_websocket(conn: &TrackedConnection, timeout: Duration) -> Result<(), ShutdownError> {
    let handshake = async {
        match conn.cleanup() {
            Some(hook) => {
                if let Err(e) = hook().await {
                    tracing::debug!(conn_id = conn.id(), error = %e, "websocket cleanup failed");
                }
                true
            }
            None => {
                if let Err(e) = conn.transport().write_raw(&WEBSOCKET_CLOSE_FRAME).await {
                    tracing::debug!(conn_id = conn.id(), error = %e, "failed to write close frame");
                    return false;
                }
                let mut reply = [0u8; 64];
                // End of stream is a hang-up, not an echo.
                matches!(conn.transport().read_raw(&mut reply).await, Ok(n) if n > 0)
            }
        }
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(true) => {
            conn.close();
            Ok(())
        }
        Ok(false) => {
            tracing::debug!(conn_id = conn.id(), "websocket peer hung up without a close echo");
            Err(ShutdownError::WebSocketCloseTimeout)
        }
        Err(_) => {
            tracing::warn!(conn_id = conn.id(), "websocket close timed out");
            Err(ShutdownError::WebSocketCloseTimeout)
        }
    }
}

/// Writes the shutdown event and waits for the stream to end.
async fn close_sse(
    conn: &TrackedConnection,
    event: &Bytes,
    timeout: Duration,
) -> Result<(), ShutdownError> {
    let flush = async {
        if let Some(tx) = conn.sse_sink().and_then(|sink| sink.upgrade()) {
            if tx.send(SseFrame::Data(event.clone())).await.is_ok() {
                let _ = tx.send(SseFrame::Close).await;
            }
            drop(tx);
            conn.released().await;
        } else if conn.transport().write_raw(event).await.is_ok() {
            let mut buf = [0u8; 64];
            while matches!(conn.transport().read_raw(&mut buf).await, Ok(n) if n > 0) {}
        }
    };

    if tokio::time::timeout(timeout, flush).await.is_ok() {
        conn.close();
        Ok(())
    } else {
        tracing::warn!(conn_id = conn.id(), "sse close timed out");
        Err(ShutdownError::SseCloseTimeout)
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn bounded(timeout: Duration, deadline: Option<Instant>) -> Duration {
    deadline.map_or(timeout, |d| {
        timeout.min(d.saturating_duration_since(Instant::now()))
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
