//! Server-Sent Events.
//!
//! [`Ctx::sse`](crate::Ctx::sse) installs an [`SseBody`] as the response
//! and returns the [`SseSender`] feeding it. The body is also reachable
//! from the connection through a weak sink, which is how the lifecycle
//! controller writes its shutdown event into a live stream.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::body::BoxError;
use crate::error::{Error, Result};

/// Payload written to SSE streams on shutdown unless configured otherwise.
pub const DEFAULT_SHUTDOWN_EVENT: &[u8] = b"event: shutdown\ndata: server shutting down\n\n";

/// Default capacity of the event channel.
pub const DEFAULT_BUFFER: usize = 32;

/// A single Server-Sent Event.
///
/// # Example
///
/// ```
/// use trellis_core::SseEvent;
///
/// let event = SseEvent::new("line one\nline two").event("update").id("7");
/// assert_eq!(
///     event.to_sse_string(),
///     "id: 7\nevent: update\ndata: line one\ndata: line two\n\n"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    id: Option<String>,
    event: Option<String>,
    data: String,
    retry: Option<Duration>,
}

impl SseEvent {
    /// Creates an event carrying `data`.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Creates an event from a JSON-serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(value)?))
    }

    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the event type.
    #[must_use]
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Sets the reconnection hint.
    #[must_use]
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The event data.
    #[must_use]
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Formats the event as an SSE text block.
    #[must_use]
    pub fn to_sse_string(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 16);
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if self.data.is_empty() {
            out.push_str("data: \n");
        }
        for line in self.data.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.as_millis().to_string());
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Formats the event as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_sse_string())
    }
}

impl From<&str> for SseEvent {
    fn from(data: &str) -> Self {
        Self::new(data)
    }
}

impl From<String> for SseEvent {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

/// One item on the SSE channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Raw bytes written verbatim.
    Data(Bytes),
    /// Ends the stream.
    Close,
}

/// Producer side of an SSE response.
#[derive(Debug, Clone)]
pub struct SseSender {
    tx: mpsc::Sender<SseFrame>,
}

impl SseSender {
    /// Sends an event, waiting for buffer space.
    pub async fn send(&self, event: impl Into<SseEvent>) -> Result<()> {
        self.send_raw(event.into().to_bytes()).await
    }

    /// Sends pre-formatted bytes.
    pub async fn send_raw(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .send(SseFrame::Data(bytes))
            .await
            .map_err(|_| Error::internal("SSE stream closed"))
    }

    /// Sends a `:` comment line, typically as a keep-alive.
    pub async fn comment(&self, text: &str) -> Result<()> {
        self.send_raw(Bytes::from(format!(": {text}\n"))).await
    }

    /// Whether the client side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ends the stream once buffered events are flushed.
    pub async fn close(&self) {
        let _ = self.tx.send(SseFrame::Close).await;
    }

    /// A weak handle that does not keep the stream open.
    #[must_use]
    pub fn sink(&self) -> mpsc::WeakSender<SseFrame> {
        self.tx.downgrade()
    }
}

/// Response body fed by an [`SseSender`].
#[derive(Debug)]
pub struct SseBody {
    rx: mpsc::Receiver<SseFrame>,
    closed: bool,
}

impl SseBody {
    /// Creates a connected sender/body pair.
    #[must_use]
    pub fn channel(buffer: usize) -> (SseSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (SseSender { tx }, Self { rx, closed: false })
    }
}

impl Body for SseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(SseFrame::Data(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(Some(SseFrame::Close) | None) => {
                self.closed = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.closed
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
