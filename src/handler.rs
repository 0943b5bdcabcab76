//! The single capability the server depends on: "given a request and a
//! writer, emit a response" (spec design note: "polymorphic handlers").
//!
//! Expressed as a one-method trait rather than a closure type alias so that
//! implementors can carry state without an extra `Arc<Mutex<_>>`; a
//! blanket impl over the closure shape keeps simple handlers a single
//! function, the way [`HandlerFn`] does.

use futures_core::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::response_writer::Sink;
use crate::types::Request;

/// Handles one request: write exactly one header, zero or more body
/// writes, then return (the server flushes on handler return).
pub trait Handler: Send + Sync {
    /// Handles `req`, writing the response through `writer`.
    fn handle<'a>(
        &'a self,
        req: Request,
        writer: &'a mut dyn Sink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Adapts a plain async function into a [`Handler`].
///
/// ```ignore
/// use sextant::{HandlerFn, response_writer::Sink};
///
/// let handler = HandlerFn::new(|_req, writer: &mut dyn Sink, _cancel| Box::pin(async move {
///     writer.write(b"Hello, world!").await?;
///     Ok(())
/// }));
/// ```
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F>
where
    F: for<'a> Fn(Request, &'a mut dyn Sink, CancellationToken) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
{
    /// Wraps `f` as a [`Handler`].
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(Request, &'a mut dyn Sink, CancellationToken) -> BoxFuture<'a, Result<(), Error>>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        req: Request,
        writer: &'a mut dyn Sink,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        (self.0)(req, writer, cancel)
    }
}
