//! Transport layer abstraction for replication.
//!
//! A [`Connector`] turns an [`Endpoint`] into a [`Connection`] that carries
//! request/reply [`Message`]s. The replicator never touches sockets directly,
//! so tests and embedders can plug in their own connectors.

use crate::endpoint::{Endpoint, UrlEndpoint};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::session::certificate_fingerprint;
use docsync_core::Database;
use docsync_peer::{PeerConfig, PeerHandler, PeerSession};
use docsync_protocol::{
    websocket_config, FrameCodec, Message, MessageSocket, NetStream, ProtocolError,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme, StreamOwned,
};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tungstenite::HandshakeError;

/// Options for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Connect and read timeout.
    pub timeout: Duration,
    /// Maximum frame payload size.
    pub max_frame_len: usize,
    /// DER certificate the peer must present during the TLS handshake.
    pub pinned_certificate: Option<Vec<u8>>,
}

/// An open, ordered, request/reply channel to a peer.
pub trait Connection: Send {
    /// Sends a request and waits for its reply.
    fn request(&mut self, message: &Message) -> ReplicatorResult<Message>;

    /// The DER certificate the peer presented, if the channel is secured.
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// Drops the underlying channel.
    fn close(&mut self) -> ReplicatorResult<()>;
}

/// Opens connections to endpoints.
pub trait Connector: Send + Sync {
    /// Connects to `endpoint`.
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> ReplicatorResult<Box<dyn Connection>>;
}

/// Connects to an in-process [`PeerHandler`].
///
/// Messages are encoded and decoded on the way through so the loopback
/// exercises the same wire format as a network connection.
#[derive(Clone)]
pub struct LoopbackConnector {
    handler: Arc<PeerHandler>,
}

impl LoopbackConnector {
    /// Connects every endpoint to `handler`.
    pub fn new(handler: Arc<PeerHandler>) -> Self {
        Self { handler }
    }

    /// Serves `database` with a default peer configuration.
    pub fn for_database(database: Database) -> Self {
        Self::new(PeerHandler::new(database, PeerConfig::default()))
    }

    /// The peer behind this connector.
    pub fn handler(&self) -> &Arc<PeerHandler> {
        &self.handler
    }
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        _endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> ReplicatorResult<Box<dyn Connection>> {
        Ok(Box::new(LoopbackConnection {
            session: Some(self.handler.session()),
            certificate: self.handler.certificate().map(<[u8]>::to_vec),
            max_frame_len: options.max_frame_len,
        }))
    }
}

struct LoopbackConnection {
    session: Option<PeerSession>,
    certificate: Option<Vec<u8>>,
    max_frame_len: usize,
}

impl LoopbackConnection {
    fn round_trip(&self, message: &Message) -> ReplicatorResult<Message> {
        let bytes = message.encode()?;
        if bytes.len() > self.max_frame_len {
            return Err(ReplicatorError::Protocol(format!(
                "message of {} bytes exceeds frame limit {}",
                bytes.len(),
                self.max_frame_len
            )));
        }
        Ok(Message::decode(&bytes)?)
    }
}

impl Connection for LoopbackConnection {
    fn request(&mut self, message: &Message) -> ReplicatorResult<Message> {
        let request = self.round_trip(message)?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ReplicatorError::transport_retryable("connection closed"))?;
        let reply = session.handle(request);
        if session.is_closed() {
            self.session = None;
        }
        self.round_trip(&reply)
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.certificate.clone()
    }

    fn close(&mut self) -> ReplicatorResult<()> {
        self.session = None;
        Ok(())
    }
}

/// Connector for `ws://` and `wss://` endpoints.
///
/// `wss` runs the WebSocket over rustls. With a pinned certificate the
/// handshake accepts exactly that certificate and nothing else; without one
/// the server chain is checked against the bundled web PKI roots. Local
/// database endpoints are not reachable over the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Creates a WebSocket connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> ReplicatorResult<Box<dyn Connection>> {
        let url = match endpoint {
            Endpoint::Url(url) => url,
            Endpoint::LocalDatabase(_) => {
                return Err(ReplicatorError::InvalidConfig(
                    "local database endpoints cannot be reached over the network".into(),
                ))
            }
        };

        let tcp = connect_tcp(url, options)?;
        let stream = if url.is_tls() {
            NetStream::TlsClient(Box::new(tls_handshake(url, tcp, options)?))
        } else {
            NetStream::Plain(tcp)
        };

        let (socket, _) = tungstenite::client::client_with_config(
            url.to_string(),
            stream,
            Some(websocket_config(options.max_frame_len)),
        )
        .map_err(|err| match err {
            HandshakeError::Failure(err) => ReplicatorError::from(ProtocolError::from(err)),
            HandshakeError::Interrupted(_) => {
                ReplicatorError::transport_retryable(format!("{url}: websocket handshake timed out"))
            }
        })?;
        debug!(%url, tls = url.is_tls(), "websocket open");
        Ok(Box::new(WebSocketConnection {
            socket: MessageSocket::new(socket, FrameCodec::new(options.max_frame_len)),
        }))
    }
}

fn connect_tcp(url: &UrlEndpoint, options: &ConnectOptions) -> ReplicatorResult<TcpStream> {
    let addrs = (url.host(), url.port())
        .to_socket_addrs()
        .map_err(|e| ReplicatorError::transport_retryable(format!("resolve {url}: {e}")))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, options.timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(options.timeout))
                    .and_then(|()| stream.set_write_timeout(Some(options.timeout)))
                    .and_then(|()| stream.set_nodelay(true))
                    .map_err(|e| ReplicatorError::transport_retryable(e.to_string()))?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, error = %err, "connect failed");
                last_error = Some(err);
            }
        }
    }
    Err(ReplicatorError::transport_retryable(match last_error {
        Some(err) => format!("connect {url}: {err}"),
        None => format!("{url}: host resolved to no addresses"),
    }))
}

/// Runs the TLS handshake to completion so certificate failures surface
/// before the WebSocket upgrade.
fn tls_handshake(
    url: &UrlEndpoint,
    mut tcp: TcpStream,
    options: &ConnectOptions,
) -> ReplicatorResult<StreamOwned<ClientConnection, TcpStream>> {
    let pinned = options.pinned_certificate.as_deref();
    let server_name = ServerName::try_from(url.host())
        .map_err(|e| ReplicatorError::InvalidEndpoint {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_owned();
    let mut conn = ClientConnection::new(client_tls_config(pinned), server_name)
        .map_err(|e| ReplicatorError::transport_fatal(format!("{url}: {e}")))?;
    while conn.is_handshaking() {
        if let Err(err) = conn.complete_io(&mut tcp) {
            return Err(tls_error(url, &err, pinned.is_some()));
        }
    }
    Ok(StreamOwned::new(conn, tcp))
}

fn client_tls_config(pinned: Option<&[u8]>) -> Arc<ClientConfig> {
    let config = match pinned {
        Some(der) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertificate::new(der)))
            .with_no_client_auth(),
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    Arc::new(config)
}

/// Maps a failed TLS handshake. Certificate problems are never retried.
fn tls_error(url: &UrlEndpoint, err: &io::Error, pinned: bool) -> ReplicatorError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(reason)) if pinned => {
            ReplicatorError::CertificateMismatch(format!("{url}: {reason:?}"))
        }
        Some(tls) => ReplicatorError::transport_fatal(format!("{url}: tls handshake failed: {tls}")),
        None => ReplicatorError::transport_retryable(format!("{url}: tls handshake failed: {err}")),
    }
}

/// Accepts exactly one server certificate, compared by SHA-256 fingerprint.
///
/// Host names and chains are not checked: the pin replaces both. Handshake
/// signatures are still verified, so the server must hold the private key.
#[derive(Debug)]
struct PinnedCertificate {
    fingerprint: [u8; 32],
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertificate {
    fn new(der: &[u8]) -> Self {
        Self {
            fingerprint: certificate_fingerprint(der),
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = certificate_fingerprint(end_entity.as_ref());
        if presented == self.fingerprint {
            return Ok(ServerCertVerified::assertion());
        }
        warn!(
            expected = %hex::encode(self.fingerprint),
            presented = %hex::encode(presented),
            "server certificate does not match the pin"
        );
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

struct WebSocketConnection {
    socket: MessageSocket<NetStream>,
}

impl Connection for WebSocketConnection {
    fn request(&mut self, message: &Message) -> ReplicatorResult<Message> {
        self.socket.send(message)?;
        Ok(self.socket.recv()?)
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.socket.get_ref().peer_certificate()
    }

    fn close(&mut self) -> ReplicatorResult<()> {
        self.socket.shutdown();
        Ok(())
    }
}
