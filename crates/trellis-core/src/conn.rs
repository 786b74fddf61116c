//! What a request context may know about its connection.
//!
//! The transport owns the tracked connection; handlers only see it through
//! [`ConnectionHandle`] so they can tag it as a WebSocket or SSE stream and
//! register a cleanup hook for shutdown.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::handler::BoxFuture;
use crate::sse::SseFrame;

/// Protocol carried by a connection, as far as shutdown is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionKind {
    /// Regular request/response traffic.
    #[default]
    Plain = 0,
    /// An upgraded WebSocket.
    WebSocket = 1,
    /// A Server-Sent Events stream.
    Sse = 2,
}

impl ConnectionKind {
    /// Decodes the atomic tag.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Self {
        match tag {
            1 => Self::WebSocket,
            2 => Self::Sse,
            _ => Self::Plain,
        }
    }

    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user hook run instead of the default WebSocket close frame.
pub type CleanupHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Weak handle to an SSE body, used to inject the shutdown event.
pub type SseSink = mpsc::WeakSender<SseFrame>;

/// The connection a request arrived on.
pub trait ConnectionHandle: Send + Sync {
    /// Unique, monotonic identifier.
    fn id(&self) -> u64;

    /// Current protocol tag.
    fn kind(&self) -> ConnectionKind;

    /// Re-tags the connection.
    fn set_kind(&self, kind: ConnectionKind);

    /// Registers the hook used to close the connection on shutdown.
    fn set_cleanup(&self, hook: CleanupHook);

    /// Registers the body an SSE shutdown event should be written into.
    fn set_sse_sink(&self, sink: SseSink);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tag_roundtrip() {
        for kind in [ConnectionKind::Plain, ConnectionKind::WebSocket, ConnectionKind::Sse] {
            assert_eq!(ConnectionKind::from_u8(kind as u8), kind);
        }
        assert_eq!(ConnectionKind::from_u8(200), ConnectionKind::Plain);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionKind::WebSocket).unwrap();
        assert_eq!(json, "\"websocket\"");
        assert_eq!(ConnectionKind::Sse.to_string(), "sse");
    }
}
