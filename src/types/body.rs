use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// The lazily-consumed byte stream of a class-2 [`crate::Response`].
///
/// Present only for class-2 responses; the caller owns it and must consume
/// it (or explicitly drop it) exactly once. Wraps whatever the connection's
/// remaining bytes are — there is no buffering here.
pub struct Body(Pin<Box<dyn AsyncRead + Send>>);

impl Body {
    pub(crate) fn new<R: AsyncRead + Send + 'static>(reader: R) -> Self {
        Self(Box::pin(reader))
    }
}

impl AsyncRead for Body {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}
