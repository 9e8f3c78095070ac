//! WebSocket transport for frames.
//!
//! Each binary WebSocket message carries exactly one frame as produced by
//! [`FrameCodec`]. [`NetStream`] is the byte stream underneath: plain TCP for
//! `ws`, or TCP wrapped in a rustls session for `wss`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{FrameCodec, LENGTH_PREFIX_LEN};
use crate::messages::Message;
use bytes::BytesMut;
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message as WsMessage, WebSocket};

/// A connected byte stream, with or without TLS.
#[derive(Debug)]
pub enum NetStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// Client side of a TLS session.
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
    /// Server side of a TLS session.
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl NetStream {
    /// The TCP socket underneath.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(tcp) => tcp,
            NetStream::TlsClient(tls) => tls.get_ref(),
            NetStream::TlsServer(tls) => tls.get_ref(),
        }
    }

    /// DER certificate the server presented during the TLS handshake.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            NetStream::TlsClient(tls) => tls
                .conn
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|cert| cert.as_ref().to_vec()),
            _ => None,
        }
    }

    /// True for TLS streams.
    pub fn is_tls(&self) -> bool {
        !matches!(self, NetStream::Plain(_))
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(tcp) => tcp.read(buf),
            NetStream::TlsClient(tls) => tls.read(buf),
            NetStream::TlsServer(tls) => tls.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(tcp) => tcp.write(buf),
            NetStream::TlsClient(tls) => tls.write(buf),
            NetStream::TlsServer(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Plain(tcp) => tcp.flush(),
            NetStream::TlsClient(tls) => tls.flush(),
            NetStream::TlsServer(tls) => tls.flush(),
        }
    }
}

/// WebSocket limits matching a frame size limit.
pub fn websocket_config(max_frame_len: usize) -> WebSocketConfig {
    let max = max_frame_len.saturating_add(LENGTH_PREFIX_LEN);
    WebSocketConfig {
        max_message_size: Some(max),
        max_frame_size: Some(max),
        ..WebSocketConfig::default()
    }
}

/// Sends and receives [`Message`]s over an established WebSocket.
#[derive(Debug)]
pub struct MessageSocket<S> {
    socket: WebSocket<S>,
    codec: FrameCodec,
}

impl<S: Read + Write> MessageSocket<S> {
    /// Wraps a socket whose opening handshake is complete.
    pub fn new(socket: WebSocket<S>, codec: FrameCodec) -> Self {
        Self { socket, codec }
    }

    /// Writes one message and flushes.
    pub fn send(&mut self, message: &Message) -> ProtocolResult<()> {
        let mut frame = BytesMut::new();
        self.codec.encode(message, &mut frame)?;
        self.socket.send(WsMessage::Binary(frame.to_vec()))?;
        Ok(())
    }

    /// Blocks until one message has arrived. Control messages are handled
    /// in passing.
    pub fn recv(&mut self) -> ProtocolResult<Message> {
        loop {
            match self.socket.read()? {
                WsMessage::Binary(data) => {
                    let mut frame = BytesMut::from(&data[..]);
                    return match self.codec.decode(&mut frame)? {
                        Some(message) if frame.is_empty() => Ok(message),
                        Some(_) => Err(ProtocolError::Decode(
                            "trailing bytes after frame".into(),
                        )),
                        None => Err(ProtocolError::Decode("truncated frame".into())),
                    };
                }
                WsMessage::Close(_) => return Err(ProtocolError::ConnectionClosed),
                WsMessage::Text(_) => {
                    return Err(ProtocolError::Decode("text message on binary channel".into()))
                }
                _ => continue,
            }
        }
    }

    /// Starts the closing handshake. Errors are ignored; the socket is gone
    /// either way.
    pub fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        self.socket.get_ref()
    }
}

impl MessageSocket<NetStream> {
    /// Closes the WebSocket and shuts the TCP socket down.
    pub fn shutdown(&mut self) {
        self.close();
        let _ = self.socket.get_ref().tcp().shutdown(Shutdown::Both);
    }
}
