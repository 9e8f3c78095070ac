//! WebSocket replication server.

use crate::config::PeerConfig;
use crate::error::{PeerError, PeerResult};
use crate::handler::PeerHandler;
use docsync_protocol::{
    websocket_config, FrameCodec, MessageSocket, NetStream, ProtocolError,
};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use tungstenite::HandshakeError;

type Connections = Arc<Mutex<HashMap<u64, TcpStream>>>;

/// Serves a [`PeerHandler`] over WebSocket, one thread per connection.
///
/// The server speaks `wss` when the handler's configuration carries a TLS
/// identity ([`PeerConfig::with_tls_identity`]) and plain `ws` otherwise.
///
/// # Example
///
/// ```
/// use docsync_core::Database;
/// use docsync_peer::{PeerConfig, PeerHandler, PeerServer};
///
/// let db = Database::open_in_memory("remote").unwrap();
/// let server = PeerServer::bind("127.0.0.1:0", PeerHandler::new(db, PeerConfig::default())).unwrap();
/// assert!(server.url("remote").starts_with("ws://127.0.0.1:"));
/// server.shutdown();
/// ```
pub struct PeerServer {
    handler: Arc<PeerHandler>,
    local_addr: SocketAddr,
    tls: bool,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
    accept_thread: Option<JoinHandle<()>>,
}

impl PeerServer {
    /// Binds a listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the TLS identity is invalid.
    pub fn bind(addr: impl ToSocketAddrs, handler: Arc<PeerHandler>) -> PeerResult<Self> {
        let tls = server_tls_config(handler.config())?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let serves_tls = tls.is_some();

        let accept_thread = {
            let handler = Arc::clone(&handler);
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            thread::Builder::new()
                .name("docsync-peer-accept".into())
                .spawn(move || accept_loop(listener, handler, tls, shutdown, connections))?
        };
        info!(%local_addr, tls = serves_tls, "peer listening");

        Ok(Self {
            handler,
            local_addr,
            tls: serves_tls,
            shutdown,
            connections,
            accept_thread: Some(accept_thread),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL a replicator uses to reach `database` on this server.
    pub fn url(&self, database: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}/{database}", self.local_addr)
    }

    /// The request handler.
    pub fn handler(&self) -> &Arc<PeerHandler> {
        &self.handler
    }

    /// Number of connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Stops accepting and closes open connections.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        for (_, stream) in self.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!(local_addr = %self.local_addr, "peer stopped");
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the rustls server configuration from the peer's TLS identity, if
/// it has one.
fn server_tls_config(config: &PeerConfig) -> PeerResult<Option<Arc<ServerConfig>>> {
    let (Some(certificate), Some(key)) = (&config.certificate, &config.private_key) else {
        return Ok(None);
    };
    let chain = vec![CertificateDer::from(certificate.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.clone()));
    let tls = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| PeerError::InvalidConfig(format!("TLS identity rejected: {e}")))?;
    Ok(Some(Arc::new(tls)))
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<PeerHandler>,
    tls: Option<Arc<ServerConfig>>,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
) {
    let next_id = AtomicU64::new(0);
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(clone) => {
                connections.lock().insert(id, clone);
            }
            Err(err) => warn!(error = %err, "cannot track connection"),
        }
        let handler = Arc::clone(&handler);
        let tls = tls.clone();
        let tracked = Arc::clone(&connections);
        let spawned = thread::Builder::new()
            .name("docsync-peer-conn".into())
            .spawn(move || {
                let remote = stream.peer_addr().ok();
                if let Err(err) = serve_connection(stream, handler, tls) {
                    debug!(?remote, error = %err, "connection ended with error");
                }
                tracked.lock().remove(&id);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "cannot spawn connection thread");
            connections.lock().remove(&id);
        }
    }
}

/// Runs one replication session on an accepted TCP stream until the client
/// closes it or the connection fails. The TLS handshake (with `tls`) and the
/// WebSocket upgrade happen first.
pub fn serve_connection(
    stream: TcpStream,
    handler: Arc<PeerHandler>,
    tls: Option<Arc<ServerConfig>>,
) -> PeerResult<()> {
    stream.set_read_timeout(handler.config().read_timeout)?;
    stream.set_nodelay(true)?;
    let stream = match tls {
        Some(tls) => {
            let conn = ServerConnection::new(tls)?;
            NetStream::TlsServer(Box::new(StreamOwned::new(conn, stream)))
        }
        None => NetStream::Plain(stream),
    };

    let max_frame_len = handler.config().max_frame_len;
    let socket = tungstenite::accept_with_config(stream, Some(websocket_config(max_frame_len)))
        .map_err(|err| match err {
            HandshakeError::Failure(err) => PeerError::Protocol(err.into()),
            HandshakeError::Interrupted(_) => PeerError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "websocket handshake timed out",
            )),
        })?;
    let mut socket = MessageSocket::new(socket, FrameCodec::new(max_frame_len));

    let mut session = handler.session();
    loop {
        let message = match socket.recv() {
            Ok(message) => message,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let reply = session.handle(message);
        socket.send(&reply)?;
        if session.is_closed() {
            socket.close();
            return Ok(());
        }
    }
}
