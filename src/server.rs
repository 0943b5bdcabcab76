//! The server engine: accepts connections, negotiates TLS against a
//! [`CertificateStore`], and runs each connection through the one-request
//! state machine `Accepted -> TLSHandshaking -> ReadingRequest -> Dispatched
//! -> WritingResponse -> Closed`.
//!
//! Per-stage timeouts are enforced independently (TLS handshake, request
//! read, response write) so a slow client can't pin a connection open
//! indefinitely, and connections are tracked individually so
//! [`Server::close`] and [`Server::shutdown`] can be driven from outside
//! the accept loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use futures_core::future::BoxFuture;
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, DistinguishedName};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::certificate::ParsedCertificate;
use crate::certstore::CertificateStore;
use crate::codec;
use crate::error::Error;
use crate::handler::Handler;
use crate::response_writer::{BufferedResponse, ResponseWriter, SharedBuffer, Sink};
use crate::tls_state::TlsState;
use crate::types::{Meta, Request, Status};
use crate::util::{bounded, deadline_exceeded, HandlerCatchUnwind};

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A running (or not-yet-started) Gemini server: a bound listener, a TLS
/// posture backed by a [`CertificateStore`], and a handler dispatched once
/// per connection.
///
/// Cheaply [`Clone`]able: the accept loop, [`Server::close`] and
/// [`Server::shutdown`] are all meant to run concurrently from separate
/// tasks against the same underlying state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    handler: Option<Arc<dyn Handler>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    connections: TokioMutex<JoinSet<()>>,
    tokens: StdMutex<HashMap<u64, CancellationToken>>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// A server builder bound to `addr`, resolving certificates through
    /// `cert_store`'s scope-keyed issuance.
    pub fn bind<A: ToSocketAddrs>(addr: A, cert_store: Arc<CertificateStore>) -> Builder<A> {
        Builder {
            addr,
            cert_store,
            handler: None,
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// The bound local address, e.g. to discover the actual port after
    /// binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Runs the accept loop until a non-recoverable I/O error occurs or the
    /// server is closed/shut down. Safe to call again (e.g. after a restart)
    /// as long as [`Self::close`]/[`Self::shutdown`] haven't been called.
    pub async fn serve(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ServerClosed);
        }

        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        loop {
            let accepted = tokio::select! {
                accepted = self.inner.listener.accept() => accepted,
                _ = self.inner.shutdown.cancelled() => return Err(Error::ServerClosed),
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_temporary_accept_error(&err) => {
                    warn!("temporary accept error: {}", err);
                    time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                    continue;
                }
                Err(err) => return Err(Error::Io(err)),
            };
            backoff = INITIAL_ACCEPT_BACKOFF;

            let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
            let cancel = CancellationToken::new();
            self.inner.tokens.lock().expect("server lock poisoned").insert(conn_id, cancel.clone());

            let server = self.clone();
            self.inner.connections.lock().await.spawn(async move {
                server.serve_connection(stream, remote_addr, conn_id, cancel).await;
            });
        }
    }

    /// Closes immediately: stops accepting, cancels every in-flight
    /// connection's per-connection token, then waits for their workers to
    /// actually exit. Further [`Self::serve`] calls return
    /// [`Error::ServerClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let tokens: Vec<CancellationToken> = {
            let mut tokens = self.inner.tokens.lock().expect("server lock poisoned");
            tokens.drain().map(|(_, token)| token).collect()
        };
        for token in tokens {
            token.cancel();
        }

        let mut connections = self.inner.connections.lock().await;
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    /// Shuts down gracefully: stops accepting but does not cancel in-flight
    /// connections, waiting up to `deadline` for them to finish on their
    /// own. Returns [`Error::Elapsed`]-shaped I/O timeout if `deadline`
    /// passes with workers still running.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let mut connections = self.inner.connections.lock().await;
        let drain = async {
            while connections.join_next().await.is_some() {}
        };

        time::timeout(deadline, drain).await.map_err(|_| deadline_exceeded())
    }

    async fn serve_connection(&self, stream: TcpStream, remote_addr: SocketAddr, conn_id: u64, cancel: CancellationToken) {
        if let Err(err) = self.serve_connection_inner(stream, remote_addr, &cancel).await {
            debug!("connection {} from {} ended: {}", conn_id, remote_addr, err);
        }

        self.inner.tokens.lock().expect("server lock poisoned").remove(&conn_id);
    }

    async fn serve_connection_inner(&self, stream: TcpStream, remote_addr: SocketAddr, cancel: &CancellationToken) -> Result<(), Error> {
        // TLSHandshaking: no usable stream exists yet, so a failure here has
        // nothing to respond on.
        let handshake = async { self.inner.tls_acceptor.accept(stream).await.map_err(Error::Io) };
        let tls_stream = bounded(handshake, self.inner.read_timeout, cancel).await?;

        let (server_name, peer_certificates) = {
            let (_, session) = tls_stream.get_ref();
            let server_name = session.sni_hostname().map(str::to_string);
            let peer_certificates = session.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
            (server_name, peer_certificates)
        };

        let tls_state = TlsState::new(server_name, peer_certificates.clone());
        let certificate = peer_certificates.into_iter().next().and_then(|cert| ParsedCertificate::parse(cert).ok());

        let mut stream = BufStream::new(tls_stream);

        // ReadingRequest: a failure from here on has a stream to respond on.
        let read = async { codec::read_request_uri(&mut stream).await };
        let url = match bounded(read, self.inner.read_timeout, cancel).await {
            Ok(url) => url,
            Err(err) => return fail(ResponseWriter::new(stream), self.inner.write_timeout, cancel, Status::BAD_REQUEST, "Malformed request", err).await,
        };

        let mut writer = ResponseWriter::new(stream);

        let mut request = match Request::with_certificate(url, certificate) {
            Ok(request) => request,
            Err(err) => return fail(writer, self.inner.write_timeout, cancel, Status::BAD_REQUEST, "Malformed request", err).await,
        };
        request.set_remote_addr(remote_addr);
        request.set_host(tls_state.server_name().unwrap_or_default());
        request.set_tls_state(tls_state);

        // Dispatched: run the handler, isolating a panic the same way the
        // old synchronous loop did.
        let result = match &self.inner.handler {
            Some(handler) => {
                let handled = AssertUnwindSafe(handler.handle(request, &mut writer, cancel.clone()));
                match HandlerCatchUnwind::new(handled).await {
                    Ok(result) => result,
                    Err(_panic) => {
                        error!("handler panicked while serving {}", remote_addr);
                        Err(Error::Io(io::Error::new(io::ErrorKind::Other, "handler panicked")))
                    }
                }
            }
            None => writer.not_found().await,
        };

        if let Err(ref err) = result {
            error!("handler failed for {}: {}", remote_addr, err);
            let _ = writer.write_header(Status::TEMPORARY_FAILURE, &Meta::new_lossy("Temporary failure")).await;
        }

        // WritingResponse: flush whatever the handler (or the failure path
        // above) produced, then Closed on drop.
        bounded(async { writer.flush().await }, self.inner.write_timeout, cancel).await?;

        result
    }
}

/// Best-effort class-4/5 response for a failure that happened after the TLS
/// stream was established but before (or instead of) a handler ran.
async fn fail<W: tokio::io::AsyncWrite + Unpin + Send>(
    mut writer: ResponseWriter<W>,
    write_timeout: Option<Duration>,
    cancel: &CancellationToken,
    status: Status,
    reason: &str,
    err: Error,
) -> Result<(), Error> {
    let _ = writer.write_header(status, &Meta::new_lossy(reason)).await;
    let _ = bounded(async { writer.flush().await }, write_timeout, cancel).await;
    Err(err)
}

fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// Builds a [`Server`].
pub struct Builder<A> {
    addr: A,
    cert_store: Arc<CertificateStore>,
    handler: Option<Arc<dyn Handler>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<A: ToSocketAddrs> Builder<A> {
    /// Installs the handler dispatched for every accepted request. Without
    /// one, every request gets `51 Not found`.
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets the deadline for the TLS handshake and the request line,
    /// enforced independently for each. `None` disables it. Defaults to 10
    /// seconds.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the deadline for flushing the response. `None` disables it.
    /// Defaults to 30 seconds.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Binds the listener and builds the TLS configuration, requesting (but
    /// not requiring) a client certificate on every connection.
    pub async fn build(self) -> anyhow::Result<Server> {
        let tls_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AnyClientCert))
            .with_cert_resolver(self.cert_store);

        let listener = TcpListener::bind(self.addr).await.context("failed to bind listener")?;

        let inner = Inner {
            listener,
            tls_acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            handler: self.handler,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            connections: TokioMutex::new(JoinSet::new()),
            tokens: StdMutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        };

        Ok(Server { inner: Arc::new(inner) })
    }
}

/// Requests a client certificate without requiring one; rustls has no
/// built-in verifier for this posture, so this implements its own, mirroring
/// [`crate::client::TofuVerifier`]'s role on the other side of the
/// handshake.
struct AnyClientCert;

impl ClientCertVerifier for AnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }
}

/// Wraps a [`Handler`], enforcing `deadline`. If the inner handler hasn't
/// finished by then, `40 Timeout` is written to the real connection and the
/// inner handler is detached into a background task that keeps writing
/// harmlessly into a buffer nobody will read.
pub struct TimeoutHandler<H> {
    inner: Arc<H>,
    deadline: Duration,
}

impl<H> TimeoutHandler<H> {
    /// Wraps `inner`, enforcing `deadline` on every request it handles.
    pub fn new(inner: H, deadline: Duration) -> Self {
        Self { inner: Arc::new(inner), deadline }
    }
}

impl<H: Handler + Send + Sync + 'static> Handler for TimeoutHandler<H> {
    fn handle<'a>(&'a self, req: Request, writer: &'a mut dyn Sink, cancel: CancellationToken) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let buffer = Arc::new(TokioMutex::new(BufferedResponse::new()));
            let inner = self.inner.clone();
            let buffered_cancel = cancel.clone();
            let buffered = buffer.clone();

            let task = tokio::spawn(async move {
                let mut sink = SharedBuffer(buffered);
                inner.handle(req, &mut sink, buffered_cancel).await
            });

            match time::timeout(self.deadline, task).await {
                Ok(joined) => {
                    let result = joined.map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "handler task panicked")))?;
                    result?;
                    let bytes = Arc::try_unwrap(buffer)
                        .ok()
                        .expect("spawned handler task has finished, dropping its buffer clone")
                        .into_inner()
                        .into_bytes()
                        .await?;
                    writer.write_raw(&bytes).await
                }
                Err(_elapsed) => {
                    writer.write_header(Status::TEMPORARY_FAILURE, Meta::new_lossy("Timeout")).await?;
                    writer.flush().await?;
                    buffer.lock().await.poison();
                    Err(Error::HandlerTimeout)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    use crate::certstore::ANY_SCOPE;
    use crate::types::URIReference;

    fn test_request() -> Request {
        let url = URIReference::try_from("gemini://example.com/").unwrap().into_owned();
        Request::from_url(url).unwrap()
    }

    async fn idle_server() -> Server {
        let cert_store = Arc::new(CertificateStore::new());
        cert_store.register(ANY_SCOPE);
        Server::bind("127.0.0.1:0", cert_store).build().await.unwrap()
    }

    #[test]
    fn temporary_accept_errors_are_classified_by_kind() {
        for kind in [io::ErrorKind::ConnectionAborted, io::ErrorKind::ConnectionReset, io::ErrorKind::ConnectionRefused] {
            assert!(is_temporary_accept_error(&io::Error::new(kind, "boom")));
        }

        for kind in [io::ErrorKind::InvalidInput, io::ErrorKind::PermissionDenied, io::ErrorKind::Other] {
            assert!(!is_temporary_accept_error(&io::Error::new(kind, "boom")));
        }
    }

    #[test]
    fn accept_backoff_doubles_and_caps() {
        let mut backoff = INITIAL_ACCEPT_BACKOFF;
        for _ in 0..20 {
            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
        }
        assert_eq!(backoff, MAX_ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn close_on_idle_server_completes() {
        let server = idle_server().await;
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_on_idle_server_completes_within_deadline() {
        let server = idle_server().await;
        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn serve_after_close_returns_server_closed() {
        let server = idle_server().await;
        server.close().await.unwrap();

        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, Error::ServerClosed));
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_accept() {
        let server = idle_server().await;

        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve().await });

        time::sleep(Duration::from_millis(20)).await;
        server.close().await.unwrap();

        let result = time::timeout(Duration::from_secs(1), task)
            .await
            .expect("serve() should return promptly once close() cancels the pending accept")
            .unwrap();
        assert!(matches!(result, Err(Error::ServerClosed)));
    }

    struct Noop;

    impl Handler for Noop {
        fn handle<'a>(&'a self, _req: Request, _writer: &'a mut dyn Sink, _cancel: CancellationToken) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Slow;

    impl Handler for Slow {
        fn handle<'a>(&'a self, _req: Request, _writer: &'a mut dyn Sink, _cancel: CancellationToken) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async {
                time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn timeout_handler_flushes_default_failure_when_handler_writes_nothing() {
        let mut writer = ResponseWriter::new(Vec::new());
        let handler = TimeoutHandler::new(Noop, Duration::from_secs(5));

        handler.handle(test_request(), &mut writer, CancellationToken::new()).await.unwrap();

        assert_eq!(writer.into_inner(), b"40 Temporary failure\r\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_handler_times_out_and_writes_timeout_status() {
        let mut writer = ResponseWriter::new(Vec::new());
        let handler = TimeoutHandler::new(Slow, Duration::from_millis(10));

        let err = handler.handle(test_request(), &mut writer, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::HandlerTimeout));
        assert_eq!(writer.into_inner(), b"40 Timeout\r\n".to_vec());
    }
}
