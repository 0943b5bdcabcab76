//! The typed error kinds this crate distinguishes.
//!
//! Internal operations return [`Error`]; a handful of call sites that glue
//! together heterogeneous setup failures (TLS config construction, binding
//! a listener) use [`anyhow::Error`] instead, the same way the upstream
//! server crate this one descends from does in its `Builder::serve`.

use std::io;

use thiserror::Error;

/// Errors produced by the codec, server, client, certificate store and TOFU
/// store.
#[derive(Debug, Error)]
pub enum Error {
    /// A request frame was malformed: missing terminator, userinfo present,
    /// or the URL exceeded 1024 bytes.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A response frame was malformed: bad status digits, bad class,
    /// missing separator, or an over-length meta.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A body write was attempted against a non-class-2 response.
    #[error("body not allowed on a non-success response")]
    BodyNotAllowed,

    /// The peer's leaf certificate had already expired at verification time.
    #[error("peer certificate for {0} has expired")]
    CertificateExpired(String),

    /// No certificate is registered or issued for the requested scope.
    #[error("no certificate for scope {0:?}")]
    CertificateUnknown(String),

    /// `get()` was asked for a hostname with no registered scope at all.
    #[error("unrecognized scope: {0}")]
    UnrecognizedScope(String),

    /// The TOFU store already pinned a different fingerprint for this host.
    #[error("certificate fingerprint mismatch for {host}: pinned {expected}, got {actual}")]
    FingerprintMismatch {
        /// Hostname whose pin changed.
        host: String,
        /// Previously pinned fingerprint (hex, colon-separated).
        expected: String,
        /// Fingerprint presented by the peer this time.
        actual: String,
    },

    /// A [`crate::server::TimeoutHandler`]-wrapped call exceeded its budget.
    #[error("handler timed out")]
    HandlerTimeout,

    /// The operation was attempted after the server was closed or shut down.
    #[error("server closed")]
    ServerClosed,

    /// The peer closed the connection before a complete frame arrived.
    #[error("eof before a complete frame")]
    Eof,

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Underlying TLS failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Timed out waiting on a `tokio::time::timeout`.
    #[error("operation timed out")]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

/// Convenience alias for `Result<T, sextant::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
