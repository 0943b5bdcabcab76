//! The response side of the wire codec, modeled as a small state machine
//! rather than a buffered `Response` object (spec design note: "Response
//! writer as a small state machine").
//!
//! `{NoHeader, HeaderWritten(class), Flushed}`, with transitions enforced
//! by the writer itself: the first write of either kind fixes the status;
//! writing body bytes before any header infers `20`; flushing with nothing
//! written yields the default `40 Temporary Failure`.

use std::io;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec;
use crate::error::Error;
use crate::types::{Meta, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    NoHeader,
    HeaderWritten(u8),
    Flushed,
}

/// A `dyn`-safe view over a response writer, so [`crate::server::TimeoutHandler`]
/// can hand a handler either the real connection or a buffered stand-in
/// without the [`crate::Handler`] trait needing to be generic over the
/// stream type.
pub trait Sink: Send {
    /// Writes the response header, if one hasn't been written yet.
    /// Ignored silently on subsequent calls.
    fn write_header<'a>(&'a mut self, status: Status, meta: Meta) -> BoxFuture<'a, Result<(), Error>>;

    /// Writes body bytes. Implicitly writes a `20` header first if none was
    /// written yet; fails with [`Error::BodyNotAllowed`] if a non-class-2
    /// header was already written.
    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<usize, Error>>;

    /// Flushes the underlying stream, writing the default `40` header first
    /// if nothing was written at all.
    fn flush<'a>(&'a mut self) -> BoxFuture<'a, Result<(), Error>>;

    /// Copies a complete, already-framed response onto this sink verbatim,
    /// bypassing header inference. Used by [`crate::server::TimeoutHandler`]
    /// to release a handler's buffered output onto the real connection once
    /// the handler finishes within its deadline.
    fn write_raw<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), Error>>;
}

/// Writes a single Gemini response header and body to `stream`.
pub struct ResponseWriter<W> {
    stream: W,
    state: WriterState,
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter<W> {
    /// Wraps `stream` in a fresh writer, with no header written yet.
    pub fn new(stream: W) -> Self {
        Self { stream, state: WriterState::NoHeader }
    }

    /// Writes the header if one hasn't been written yet. A second call is a
    /// no-op, matching the handler contract ("multiple header writes are
    /// silently ignored after the first").
    pub async fn write_header(&mut self, status: Status, meta: &Meta) -> Result<(), Error> {
        if self.state == WriterState::NoHeader {
            codec::write_response_header(&mut self.stream, status, meta).await?;
            self.state = WriterState::HeaderWritten(status.class());
        }
        Ok(())
    }

    /// Writes body bytes, implicitly opening a `20` header first if none
    /// has been written.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        if self.state == WriterState::NoHeader {
            self.write_header(Status::SUCCESS, &Meta::new_lossy(codec::DEFAULT_SUCCESS_META)).await?;
        }

        match self.state {
            WriterState::HeaderWritten(2) => {
                self.stream.write_all(bytes).await?;
                Ok(bytes.len())
            }
            WriterState::HeaderWritten(_) => Err(Error::BodyNotAllowed),
            WriterState::Flushed => Err(already_flushed()),
            WriterState::NoHeader => unreachable!("write_header always leaves HeaderWritten"),
        }
    }

    /// Flushes the underlying stream. If nothing was ever written, emits
    /// the default `40 Temporary Failure` header first.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.state == WriterState::NoHeader {
            self.write_header(Status::TEMPORARY_FAILURE, &Meta::new_lossy("Temporary failure")).await?;
        }
        self.stream.flush().await?;
        self.state = WriterState::Flushed;
        Ok(())
    }

    /// Whether a header has been written (implicitly or explicitly).
    pub fn header_written(&self) -> bool {
        self.state != WriterState::NoHeader
    }

    /// Consumes the writer, returning the underlying stream. Exposed for
    /// tests elsewhere in the crate that need to inspect exactly what was
    /// written.
    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.stream
    }

    /// Convenience: writes a `51 Not found` header.
    pub async fn not_found(&mut self) -> Result<(), Error> {
        self.write_header(Status::NOT_FOUND, &Meta::new_lossy("Not found")).await
    }

    /// Convenience: writes a `59 Bad request` header.
    pub async fn bad_request(&mut self, reason: impl AsRef<str>) -> Result<(), Error> {
        self.write_header(Status::BAD_REQUEST, &Meta::new_lossy(reason.as_ref())).await
    }

    /// Convenience: writes a `31 Permanent redirect` header to `location`.
    pub async fn redirect_permanent(&mut self, location: impl AsRef<str>) -> Result<(), Error> {
        self.write_header(Status::REDIRECT_PERMANENT, &Meta::new_lossy(location.as_ref())).await
    }
}

impl<W: AsyncWrite + Unpin + Send> Sink for ResponseWriter<W> {
    fn write_header<'a>(&'a mut self, status: Status, meta: Meta) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.write_header(status, &meta).await })
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { self.write(bytes).await })
    }

    fn flush<'a>(&'a mut self) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.flush().await })
    }

    fn write_raw<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.stream.write_all(bytes).await?;
            self.state = WriterState::Flushed;
            Ok(())
        })
    }
}

fn already_flushed() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "response writer already flushed"))
}

/// A [`Sink`] over a writer shared through a lock, used by
/// [`crate::server::TimeoutHandler`] to let a spawned handler keep writing
/// into a buffer after the deadline has fired elsewhere.
#[derive(Clone)]
pub(crate) struct SharedBuffer(pub(crate) Arc<Mutex<BufferedResponse>>);

/// The in-memory stand-in [`ResponseWriter`] buffers into, plus a poison
/// flag [`crate::server::TimeoutHandler`] sets once it has already emitted
/// `40 Timeout` on the real connection.
pub(crate) struct BufferedResponse {
    writer: ResponseWriter<Vec<u8>>,
    poisoned: bool,
}

impl BufferedResponse {
    pub(crate) fn new() -> Self {
        Self { writer: ResponseWriter::new(Vec::new()), poisoned: false }
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Flushes the inner writer (writing the default `40 Temporary failure`
    /// header first if the handler never wrote anything at all, matching
    /// the direct-writer flush contract) and returns the framed bytes.
    pub(crate) async fn into_bytes(mut self) -> Result<Vec<u8>, Error> {
        self.writer.flush().await?;
        Ok(self.writer.stream)
    }
}

impl Sink for SharedBuffer {
    fn write_header<'a>(&'a mut self, status: Status, meta: Meta) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut guard = self.0.lock().await;
            if guard.poisoned {
                return Err(Error::HandlerTimeout);
            }
            guard.writer.write_header(status, &meta).await
        })
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let mut guard = self.0.lock().await;
            if guard.poisoned {
                return Err(Error::HandlerTimeout);
            }
            guard.writer.write(bytes).await
        })
    }

    fn flush<'a>(&'a mut self) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut guard = self.0.lock().await;
            if guard.poisoned {
                return Err(Error::HandlerTimeout);
            }
            guard.writer.flush().await
        })
    }

    fn write_raw<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut guard = self.0.lock().await;
            if guard.poisoned {
                return Err(Error::HandlerTimeout);
            }
            guard.writer.write_raw(bytes).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_before_header_infers_success() {
        let mut writer = ResponseWriter::new(Vec::new());
        writer.write(b"Hello, world!").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(writer.stream, b"20 text/gemini; charset=utf-8\r\nHello, world!".to_vec());
    }

    #[tokio::test]
    async fn flush_without_write_yields_default_failure() {
        let mut writer = ResponseWriter::new(Vec::new());
        writer.flush().await.unwrap();

        assert_eq!(writer.stream, b"40 Temporary failure\r\n".to_vec());
    }

    #[tokio::test]
    async fn second_header_write_is_ignored() {
        let mut writer = ResponseWriter::new(Vec::new());
        writer.write_header(Status::INPUT, &Meta::new_lossy("Search query")).await.unwrap();
        writer.write_header(Status::NOT_FOUND, &Meta::new_lossy("Not found")).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(writer.stream, b"10 Search query\r\n".to_vec());
    }

    #[tokio::test]
    async fn body_write_after_non_success_header_fails() {
        let mut writer = ResponseWriter::new(Vec::new());
        writer.not_found().await.unwrap();

        let err = writer.write(b"extra").await.unwrap_err();
        assert!(matches!(err, Error::BodyNotAllowed));
    }
}
