//! A snapshot of the TLS handshake, captured once at handshake completion
//! and attached to both the server-side [`crate::Request`] and the
//! client-side [`crate::Response`].

use rustls::Certificate;

/// Observable facts about a completed TLS handshake.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    server_name: Option<String>,
    peer_certificates: Vec<Certificate>,
}

impl TlsState {
    /// Builds a handshake snapshot from the negotiated SNI server name and
    /// the peer's certificate chain (empty if the peer presented none).
    pub fn new(server_name: Option<String>, peer_certificates: Vec<Certificate>) -> Self {
        Self { server_name, peer_certificates }
    }

    /// The SNI server name the peer asked for (server side) or presented
    /// (client side), if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// The full peer certificate chain, leaf first.
    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }
}
