//! sextant: a Gemini protocol implementation — wire codec, server engine,
//! request multiplexer, client engine, on-demand certificate issuance, and
//! TOFU host pinning.

#[macro_use] extern crate log;

use lazy_static::lazy_static;

pub mod certificate;
pub mod certstore;
pub mod client;
pub mod codec;
pub mod error;
pub mod gemtext;
pub mod handler;
pub mod mux;
pub mod response_writer;
pub mod server;
pub mod tls_state;
pub mod tofu;
pub mod types;
pub mod util;

pub use mime;
pub use uriparse as uri;

pub use client::Client;
pub use certstore::CertificateStore;
pub use error::{Error, Result};
pub use handler::{Handler, HandlerFn};
pub use mux::Mux;
pub use response_writer::{ResponseWriter, Sink};
pub use server::Server;
pub use tls_state::TlsState;
pub use tofu::TofuStore;
pub use types::*;

/// The registered port for the Gemini protocol.
pub const GEMINI_PORT: u16 = 1965;

/// Mime type string for Gemini documents.
pub const GEMINI_MIME_STR: &str = "text/gemini";

lazy_static! {
    /// Mime type for Gemini documents ("text/gemini").
    pub static ref GEMINI_MIME: mime::Mime = GEMINI_MIME_STR.parse().expect("sextant BUG");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_mime_parses() {
        let _: &mime::Mime = &GEMINI_MIME;
    }

    #[test]
    fn gemini_port_is_standard() {
        assert_eq!(GEMINI_PORT, 1965);
    }
}
