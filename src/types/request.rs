use std::net::SocketAddr;
use std::ops;

use percent_encoding::percent_decode_str;
use uriparse::URIReference;

use crate::certificate::ParsedCertificate;
use crate::error::Error;
use crate::tls_state::TlsState;

/// A single Gemini request: an absolute URL, optionally a client identity,
/// and (server-side) the observation fields the connection populated.
///
/// Immutable once dispatched to a handler. Constructed either by the codec
/// on accept, or by a client caller before dialing.
pub struct Request {
    url: URIReference<'static>,
    input: Option<String>,
    certificate: Option<ParsedCertificate>,
    trailing_segments: Option<Vec<String>>,

    /// Client-side override of the TCP endpoint (`host:port`); empty means
    /// derive the endpoint from `url`, defaulting the port to 1965. Never
    /// rewrites the URL the server observes.
    host: String,

    /// Populated by the server from the accepted socket.
    remote_addr: Option<SocketAddr>,

    /// Populated by either side at handshake completion.
    tls_state: Option<TlsState>,
}

/// Maximum length, in bytes, of a request's serialized URL.
pub const URL_MAX_LEN: usize = 1024;

impl Request {
    /// Builds a request from a bare URL, with no client identity.
    pub fn from_url(url: URIReference<'static>) -> Result<Self, Error> {
        Self::with_certificate(url, None)
    }

    /// Builds a request from a URL and an optional client certificate.
    ///
    /// Fails if `url`'s serialized form exceeds [`URL_MAX_LEN`] bytes or it
    /// carries userinfo, matching the wire invariant in [`crate::codec`].
    pub fn with_certificate(
        mut url: URIReference<'static>,
        certificate: Option<ParsedCertificate>,
    ) -> Result<Self, Error> {
        url.normalize();

        let has_userinfo = url
            .authority()
            .map(|authority| authority.username().is_some() || authority.password().is_some())
            .unwrap_or(false);

        if has_userinfo {
            return Err(Error::InvalidRequest("request URL must not contain userinfo".into()));
        }

        if url.to_string().len() > URL_MAX_LEN {
            return Err(Error::InvalidRequest(format!("request URL exceeds {} bytes", URL_MAX_LEN)));
        }

        let input = match url.query() {
            None => None,
            Some(query) => {
                let input = percent_decode_str(query.as_str())
                    .decode_utf8()
                    .map_err(|_| Error::InvalidRequest("request query contains invalid UTF-8".into()))?
                    .into_owned();
                Some(input)
            }
        };

        Ok(Self {
            url,
            input,
            certificate,
            trailing_segments: None,
            host: String::new(),
            remote_addr: None,
            tls_state: None,
        })
    }

    /// The parsed, absolute request URL.
    pub const fn url(&self) -> &URIReference {
        &self.url
    }

    /// The client-side TCP endpoint override, if any (`""` means "derive
    /// from `url`").
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sets the TCP endpoint override. Only affects where the client
    /// dials; never rewrites `url`.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The socket address the server accepted this connection from.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    /// The TLS handshake snapshot, once populated.
    pub fn tls_state(&self) -> Option<&TlsState> {
        self.tls_state.as_ref()
    }

    pub(crate) fn set_tls_state(&mut self, tls_state: TlsState) {
        self.tls_state = Some(tls_state);
    }

    /// All of the path segments following the route to which this request
    /// was bound.
    ///
    /// For example, if the handler was bound to the `/api` route and the
    /// request is for `/api/v1/endpoint`, this returns `["v1", "endpoint"]`.
    /// Unlike [`path_segments`](Self::path_segments), it only includes
    /// segments past the bound pattern. Empty for requests that weren't
    /// routed through [`crate::mux::Mux`], or that matched an exact
    /// (non-subtree) pattern.
    pub fn trailing_segments(&self) -> &[String] {
        self.trailing_segments.as_deref().unwrap_or(&[])
    }

    pub(crate) fn set_trailing_segments(&mut self, segments: Vec<String>) {
        self.trailing_segments = Some(segments);
    }

    /// All path segments, percent-decoded.
    pub fn path_segments(&self) -> Vec<String> {
        self.url
            .path()
            .segments()
            .iter()
            .map(|segment| percent_decode_str(segment.as_str()).decode_utf8_lossy().into_owned())
            .collect()
    }

    /// The percent-decoded query string, interpreted as an input-prompt
    /// response; `None` if the URL had no query component.
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// The client's parsed leaf certificate, if the peer presented one.
    pub fn certificate(&self) -> Option<&ParsedCertificate> {
        self.certificate.as_ref()
    }

    pub(crate) fn set_certificate(&mut self, certificate: Option<ParsedCertificate>) {
        self.certificate = certificate;
    }
}

impl ops::Deref for Request {
    type Target = URIReference<'static>;

    fn deref(&self) -> &Self::Target {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn url(s: &str) -> URIReference<'static> {
        URIReference::try_from(s).unwrap().into_owned()
    }

    #[test]
    fn rejects_userinfo() {
        let err = Request::from_url(url("gemini://user@example.com/")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn rejects_oversized_url() {
        let long_path = "a".repeat(URL_MAX_LEN);
        let err = Request::from_url(url(&format!("gemini://example.com/{}", long_path))).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn decodes_query_as_input() {
        let req = Request::from_url(url("gemini://example.com/search?hello%20world")).unwrap();
        assert_eq!(req.input(), Some("hello world"));
    }

    #[test]
    fn host_override_defaults_empty() {
        let req = Request::from_url(url("gemini://example.com/")).unwrap();
        assert_eq!(req.host(), "");
    }
}
