//! The client engine: dials, completes a TOFU-style TLS handshake, and runs
//! one request/response exchange.
//!
//! TLS verification is delegated entirely to a caller-supplied trust hook
//! via rustls's `dangerous_configuration` escape hatch — there is no CA
//! chain here, since trust is established by pinning, not by a root store.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use uriparse::URIReference;

use crate::certificate::ParsedCertificate;
use crate::codec;
use crate::error::Error;
use crate::tls_state::TlsState;
use crate::types::{Request, Response};
use crate::util::race_cancel;

/// Hook consulted after a leaf passes hostname/expiry checks — typically
/// backed by a [`crate::tofu::TofuStore`]. Not installing one means "trust
/// anything", which is a valid but dangerous choice this API permits.
pub type TrustHook = Arc<dyn Fn(&str, &ParsedCertificate) -> Result<(), Error> + Send + Sync>;

/// A Gemini client: a preconfigured TLS posture plus an optional client
/// identity, reusable across many requests.
#[derive(Clone)]
pub struct Client {
    tls_config: Arc<rustls::ClientConfig>,
    pending_error: Arc<Mutex<Option<Error>>>,
    timeout: Option<std::time::Duration>,
}

impl Client {
    /// A client builder with no trust hook installed ("trust anything").
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Performs one request/response exchange, honoring `self`'s configured
    /// timeout as the deadline for the whole exchange if one is set.
    pub async fn request(&self, request: Request, cancel: CancellationToken) -> Result<Response, Error> {
        match self.timeout {
            Some(timeout) => time::timeout(timeout, self.request_inner(request, cancel))
                .await
                .map_err(Error::from)?,
            None => self.request_inner(request, cancel).await,
        }
    }

    async fn request_inner(&self, request: Request, cancel: CancellationToken) -> Result<Response, Error> {
        let (raw_host, port) = endpoint(&request)?;
        let host = to_ascii_host(&raw_host)?;
        let punycoded_url = punycode_url(request.url(), &host)?;

        let dial = TcpStream::connect((host.as_str(), port));
        let stream = race_cancel(dial, &cancel).await??;

        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|_| Error::InvalidRequest(format!("{:?} is not a valid TLS server name", host)))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let handshake = connector.connect(server_name, stream);
        let tls_stream = match race_cancel(handshake, &cancel).await? {
            Ok(stream) => stream,
            Err(err) => {
                if let Some(pending) = self.pending_error.lock().expect("client lock poisoned").take() {
                    return Err(pending);
                }
                return Err(Error::Tls(err));
            }
        };

        let peer_certificates = tls_stream.get_ref().1.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
        let tls_state = TlsState::new(Some(host.clone()), peer_certificates);

        let mut stream = BufStream::new(tls_stream);

        let write = codec::write_request_uri(&mut stream, &punycoded_url);
        race_cancel(write, &cancel).await??;

        let read = async {
            let (status, meta) = codec::read_response_header(&mut stream).await?;
            Result::<_, Error>::Ok((status, meta))
        };
        let (status, meta) = race_cancel(read, &cancel).await??;

        let body = if status.class() == 2 { Some(crate::types::Body::new(stream)) } else { None };

        let mut response = Response::new(status, meta, body);
        response.set_tls_state(tls_state);
        Ok(response)
    }
}

/// Resolves the TCP endpoint: `request.host` overrides the URL's host but
/// never its value; the URL's host is used otherwise.
fn endpoint(request: &Request) -> Result<(String, u16), Error> {
    if !request.host().is_empty() {
        return split_host_port(request.host());
    }

    let authority = request
        .url()
        .authority()
        .ok_or_else(|| Error::InvalidRequest("request URL has no host".into()))?;

    let host = authority.host().to_string();
    let port = authority.port().unwrap_or(crate::GEMINI_PORT);
    Ok((host, port))
}

fn split_host_port(host_port: &str) -> Result<(String, u16), Error> {
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| Error::InvalidRequest(format!("invalid port in {:?}", host_port)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((host_port.to_string(), crate::GEMINI_PORT)),
    }
}

/// Punycodes a non-ASCII host and, if it changed anything, rewrites the URL
/// so the server sees the canonical form.
fn punycode_url<'a>(url: &URIReference<'a>, ascii_host: &str) -> Result<URIReference<'static>, Error> {
    let original_host = url.authority().map(|a| a.host().to_string()).unwrap_or_default();

    if original_host.eq_ignore_ascii_case(ascii_host) {
        return Ok(url.clone().into_owned());
    }

    let authority = url.authority().expect("a non-empty original host implies an authority");

    let mut rebuilt = String::new();
    if let Some(scheme) = url.scheme() {
        rebuilt.push_str(scheme.as_str());
        rebuilt.push(':');
    }
    rebuilt.push_str("//");
    if let Some(username) = authority.username() {
        rebuilt.push_str(username.as_str());
        if let Some(password) = authority.password() {
            rebuilt.push(':');
            rebuilt.push_str(password.as_str());
        }
        rebuilt.push('@');
    }
    rebuilt.push_str(ascii_host);
    if let Some(port) = authority.port() {
        rebuilt.push(':');
        rebuilt.push_str(&port.to_string());
    }
    rebuilt.push_str(url.path().as_str());
    if let Some(query) = url.query() {
        rebuilt.push('?');
        rebuilt.push_str(query.as_str());
    }
    if let Some(fragment) = url.fragment() {
        rebuilt.push('#');
        rebuilt.push_str(fragment.as_str());
    }

    URIReference::try_from(rebuilt.as_str())
        .map(|reference| reference.into_owned())
        .map_err(|err| Error::InvalidRequest(format!("failed to rewrite host: {}", err)))
}

fn to_ascii_host(host: &str) -> Result<String, Error> {
    if host.is_ascii() {
        return Ok(host.to_string());
    }

    idna::domain_to_ascii(host).map_err(|_| Error::InvalidRequest(format!("{:?} is not a valid IDN hostname", host)))
}

/// Builds a [`Client`].
pub struct Builder {
    trust_hook: Option<TrustHook>,
    identity: Option<(rustls::Certificate, rustls::PrivateKey)>,
    timeout: Option<std::time::Duration>,
}

impl Default for Builder {
    fn default() -> Self {
        Self { trust_hook: None, identity: None, timeout: None }
    }
}

impl Builder {
    /// Installs the hook consulted after hostname/expiry checks pass.
    /// Typically wraps a [`crate::tofu::TofuStore`]'s
    /// [`tofu`](crate::tofu::TofuStore::tofu) method.
    pub fn trust_hook(mut self, hook: TrustHook) -> Self {
        self.trust_hook = Some(hook);
        self
    }

    /// Supplies a client identity presented on every connection made by
    /// the resulting [`Client`]. [`Request`] carries an observed peer
    /// certificate, not a signable one, so identity is a client-wide
    /// setting rather than a per-request override.
    pub fn identity(mut self, cert: rustls::Certificate, key: rustls::PrivateKey) -> Self {
        self.identity = Some((cert, key));
        self
    }

    /// Sets the overall connection timeout (covers dial + handshake +
    /// request + response header); `None` (the default) means no timeout.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the [`Client`].
    pub fn build(self) -> Result<Client, Error> {
        let pending_error = Arc::new(Mutex::new(None));

        let verifier = TofuVerifier { hook: self.trust_hook, pending_error: pending_error.clone() };

        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let tls_config = match self.identity {
            Some((cert, key)) => builder.with_client_auth_cert(vec![cert], key).map_err(Error::Tls)?,
            None => builder.with_no_client_auth(),
        };

        Ok(Client { tls_config: Arc::new(tls_config), pending_error, timeout: self.timeout })
    }
}

/// Verifies a server's leaf against hostname and expiry, then delegates to
/// an optional trust hook; otherwise accepts everything (no PKI check at
/// all — TOFU stands in for it).
struct TofuVerifier {
    hook: Option<TrustHook>,
    pending_error: Arc<Mutex<Option<Error>>>,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let parsed = ParsedCertificate::parse(end_entity.clone())
            .map_err(|err| rustls::Error::General(err.to_string()))?;

        let hostname = match server_name {
            rustls::ServerName::DnsName(name) => name.as_ref().to_string(),
            _ => return Err(rustls::Error::General("only DNS server names are supported".into())),
        };

        if !parsed.matches_hostname(&hostname) {
            let err = Error::InvalidResponse(format!("certificate does not cover {:?}", hostname));
            *self.pending_error.lock().expect("client lock poisoned") = Some(err);
            return Err(rustls::Error::General("certificate hostname mismatch".into()));
        }

        if parsed.is_expired_at(now) {
            let err = Error::CertificateExpired(hostname.clone());
            *self.pending_error.lock().expect("client lock poisoned") = Some(err);
            return Err(rustls::Error::General("certificate expired".into()));
        }

        if let Some(hook) = &self.hook {
            if let Err(err) = hook(&hostname, &parsed) {
                *self.pending_error.lock().expect("client lock poisoned") = Some(err);
                return Err(rustls::Error::General("rejected by trust hook".into()));
            }
        }

        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn endpoint_defaults_to_url_host_and_gemini_port() {
        let url = URIReference::try_from("gemini://example.com/").unwrap().into_owned();
        let req = Request::from_url(url).unwrap();
        assert_eq!(endpoint(&req).unwrap(), ("example.com".to_string(), crate::GEMINI_PORT));
    }

    #[test]
    fn endpoint_honors_host_override_without_touching_url() {
        let url = URIReference::try_from("gemini://example.com/").unwrap().into_owned();
        let mut req = Request::from_url(url).unwrap();
        req.set_host("10.0.0.1:1965");

        let (host, port) = endpoint(&req).unwrap();
        assert_eq!((host.as_str(), port), ("10.0.0.1", 1965));
        assert_eq!(req.url().authority().unwrap().host(), "example.com");
    }

    #[test]
    fn ascii_host_is_unchanged() {
        assert_eq!(to_ascii_host("example.com").unwrap(), "example.com");
    }
}
