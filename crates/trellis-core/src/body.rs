//! Response body types.

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;

/// Error type carried by streaming bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type handed to the transport.
pub type Body = BoxBody<Bytes, BoxError>;

/// A body holding `bytes`.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// An empty body.
pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A body streaming the chunks of `stream`.
pub fn from_stream<S, E>(stream: S) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
    E: Into<BoxError> + 'static,
{
    BodyExt::boxed(StreamBody::new(stream.map_ok(Frame::data).map_err(Into::<BoxError>::into)))
}

/// The response body as the context holds it until the transport takes it.
#[derive(Default)]
pub enum ResponseBody {
    /// No body written.
    #[default]
    Empty,
    /// A buffered body.
    Bytes(Bytes),
    /// A streaming body.
    Stream(Body),
}

impl ResponseBody {
    /// Buffered bytes, if the body is not streaming.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Stream(_) => false,
        }
    }

    /// Converts into the transport body type.
    #[must_use]
    pub fn into_body(self) -> Body {
        match self {
            Self::Empty => empty(),
            Self::Bytes(b) => full(b),
            Self::Stream(s) => s,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}
