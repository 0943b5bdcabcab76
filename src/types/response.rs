use crate::tls_state::TlsState;
use crate::types::{Body, Meta, Status};

/// A response as observed by the client: a status, a class-dependent
/// `meta`, and (class 2 only) a lazily-consumed body.
///
/// The body, if any, is owned by the caller and must be consumed or
/// explicitly dropped exactly once; the connection only closes once that
/// happens.
pub struct Response {
    status: Status,
    meta: Meta,
    body: Option<Body>,
    tls_state: Option<TlsState>,
}

impl Response {
    pub(crate) fn new(status: Status, meta: Meta, body: Option<Body>) -> Self {
        Self { status, meta, body, tls_state: None }
    }

    /// The response status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// The response's `meta` string: a media type for class 2, class-
    /// specific text otherwise.
    pub const fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Takes ownership of the body stream, if this is a class-2 response
    /// and the body hasn't already been taken.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// The TLS handshake snapshot captured when this response was received.
    pub fn tls_state(&self) -> Option<&TlsState> {
        self.tls_state.as_ref()
    }

    pub(crate) fn set_tls_state(&mut self, tls_state: TlsState) {
        self.tls_state = Some(tls_state);
    }
}
