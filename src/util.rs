use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use futures_core::future::Future;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A convenience trait alias for `AsRef<T> + Into<T::Owned>`,
/// most commonly used to accept `&str` or `String`:
///
/// `Cowy<str>` ⇔ `AsRef<str> + Into<String>`
pub trait Cowy<T>
where
    Self: AsRef<T> + Into<T::Owned>,
    T: ToOwned + ?Sized,
{}

impl<C, T> Cowy<T> for C
where
    C: AsRef<T> + Into<T::Owned>,
    T: ToOwned + ?Sized,
{}

/// A utility for catching unwinds on Futures.
///
/// This is adapted from the futures-rs CatchUnwind, in an effort to reduce the large
/// amount of dependencies tied into the feature that provides this simple struct.
/// Generic over the wrapped future so [`crate::server`] can use it on a
/// borrowed, non-`'static` handler future rather than the boxed owned one
/// this was originally written against.
#[must_use = "futures do nothing unless polled"]
pub(crate) struct HandlerCatchUnwind<F> {
    future: AssertUnwindSafe<F>,
}

impl<F> HandlerCatchUnwind<F> {
    pub(crate) fn new(future: AssertUnwindSafe<F>) -> Self {
        Self { future }
    }
}

impl<F: Future + Unpin> Future for HandlerCatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn std::any::Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(cx))) {
            Ok(res) => res.map(Ok),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

pub(crate) async fn opt_timeout<T>(duration: Option<time::Duration>, future: impl Future<Output = T>) -> Result<T, time::error::Elapsed> {
    match duration {
        Some(duration) => time::timeout(duration, future).await,
        None => Ok(future.await),
    }
}

/// Races `future` against `cancel`, mapping cancellation to
/// [`Error::ServerClosed`]. Used by both the client (overall request
/// cancellation) and the server (per-connection shutdown).
pub(crate) async fn race_cancel<F, T>(future: F, cancel: &CancellationToken) -> Result<T, Error>
where
    F: Future<Output = T>,
{
    tokio::select! {
        result = future => Ok(result),
        _ = cancel.cancelled() => Err(Error::ServerClosed),
    }
}

/// Combines a deadline and a cancellation token around one fallible
/// operation: the operation's own error wins, then the deadline (reported
/// as an I/O timeout), then cancellation (as [`Error::ServerClosed`]).
pub(crate) async fn bounded<F, T>(
    future: F,
    deadline: Option<time::Duration>,
    cancel: &CancellationToken,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let guarded = async {
        match deadline {
            Some(duration) => time::timeout(duration, future).await.map_err(|_| deadline_exceeded())?,
            None => future.await,
        }
    };

    race_cancel(guarded, cancel).await?
}

pub(crate) fn deadline_exceeded() -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"))
}
