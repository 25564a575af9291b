//! A TCP socket plus TLS state with an explicit handshake lifecycle.
//!
//! ```text
//! client:          Unconnected -> Connecting -> Established
//! server, 2-step:  Unconnected -> AcceptedNoHandshake -> Handshaking -> Established
//! server, 1-step:  Unconnected -> Handshaking -> Established
//! any live state -> Failed;  anything but Closed -> Closed (only via close())
//! ```
//!
//! The peer credential is present exactly while the state is `Established`.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::codec::MessageChannel;
use crate::config::TransportConfig;
use crate::credentials::{extract_credential, Credential};
use crate::errors::TransportError;
use crate::tls::{ClientTlsContext, ServerTlsContext};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Unconnected,
    Connecting,
    AcceptedNoHandshake,
    Handshaking,
    Established,
    Failed,
    Closed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    fn can_transition_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;

        match (self, next) {
            (Unconnected, Connecting | AcceptedNoHandshake | Handshaking) => true,
            (AcceptedNoHandshake, Handshaking) => true,
            (Connecting | Handshaking, Established) => true,
            (Unconnected | Connecting | AcceptedNoHandshake | Handshaking | Established, Failed) => {
                true
            }
            (Closed, Closed) => false,
            (_, Closed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum Io {
    Detached,
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

enum TlsSide {
    Client(ClientTlsContext),
    Server(Arc<ServerTlsContext>),
}

/// Exclusively owns its socket; `close()` is the single place it is
/// released, TLS shutdown first.
pub struct SecureConnection {
    role: Role,
    state: HandshakeState,
    io: Io,
    tls: TlsSide,
    peer: Option<Arc<Credential>>,
    peer_addr: Option<SocketAddr>,
    config: TransportConfig,
    current_timeout: Duration,
    codec: LengthDelimitedCodec,
    read_buf: BytesMut,
}

impl SecureConnection {
    fn with_parts(role: Role, tls: TlsSide, config: TransportConfig) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(config.max_frame_size)
            .new_codec();
        Self {
            role,
            state: HandshakeState::Unconnected,
            io: Io::Detached,
            tls,
            peer: None,
            peer_addr: None,
            current_timeout: config.handshake_timeout,
            config,
            codec,
            read_buf: BytesMut::new(),
        }
    }

    /// An unconnected client; see [`connect`](Self::connect).
    pub fn client(tls: ClientTlsContext, config: TransportConfig) -> Self {
        Self::with_parts(Role::Client, TlsSide::Client(tls), config)
    }

    /// Connects and handshakes in one go.
    pub async fn connect_to(
        host: &str,
        port: u16,
        tls: ClientTlsContext,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut connection = Self::client(tls, config);
        connection.connect(host, port).await?;
        Ok(connection)
    }

    pub(crate) fn server(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<ServerTlsContext>,
        config: TransportConfig,
    ) -> Self {
        let mut connection = Self::with_parts(Role::Server, TlsSide::Server(context), config);
        connection.io = Io::Plain(stream);
        connection.peer_addr = Some(peer_addr);
        connection
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer_credential(&self) -> Option<&Arc<Credential>> {
        self.peer.as_ref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Timeout currently bounding socket operations.
    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    fn transition(&mut self, next: HandshakeState) -> Result<(), TransportError> {
        if !self.state.can_transition_to(next) {
            return Err(TransportError::InvalidState {
                expected: "a state that may advance",
                actual: self.state,
            });
        }
        debug!(role = ?self.role, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
        if next != HandshakeState::Established {
            self.peer = None;
        }
        Ok(())
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        if self.state.can_transition_to(HandshakeState::Failed) {
            let _ = self.transition(HandshakeState::Failed);
        }
        err
    }

    /// Keeps the stream even when the credential is rejected so that
    /// `close()` can still shut TLS down properly.
    fn establish(&mut self, stream: TlsStream<TcpStream>) -> Result<(), TransportError> {
        let credential = {
            let (_tcp, session) = stream.get_ref();
            extract_credential(session.peer_certificates().unwrap_or_default())
        };
        self.io = Io::Tls(Box::new(stream));
        let credential = credential?;
        self.transition(HandshakeState::Established)?;
        self.peer = Some(Arc::new(credential));
        self.current_timeout = self.config.rpc_timeout;
        Ok(())
    }

    /// Resolves `host` (IPv6 first), connects under the handshake timeout,
    /// performs the TLS handshake with SNI, then switches to the RPC
    /// timeout. Never retried here.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if self.role != Role::Client || self.state != HandshakeState::Unconnected {
            return Err(TransportError::InvalidState {
                expected: "an unconnected client",
                actual: self.state,
            });
        }
        self.transition(HandshakeState::Connecting)?;

        match self.open_client(host, port).await {
            Ok(stream) => self.establish(stream).map_err(|err| self.fail(err)),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn open_client(&mut self, host: &str, port: u16) -> Result<TlsStream<TcpStream>, TransportError> {
        let TlsSide::Client(tls) = &self.tls else {
            return Err(TransportError::InvalidState {
                expected: "a client connection",
                actual: self.state,
            });
        };
        let connector = TlsConnector::from(tls.config());
        let limit = self.config.handshake_timeout;

        let name = self.config.server_name.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::ConnectionError(format!("invalid server name {name}")))?;

        let (tcp, peer_addr) = connect_tcp(host, port, limit).await?;
        self.peer_addr = Some(peer_addr);
        configure_socket(&tcp, self.config.keepalive)?;

        let stream = timeout(limit, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::timeout("TLS handshake", limit))?
            .map_err(|err| TransportError::TlsError(format!("handshake with {peer_addr} failed: {err}")))?;

        Ok(TlsStream::Client(stream))
    }

    /// Second step of a two-step accept: negotiate TLS on a connection in
    /// `AcceptedNoHandshake`. On failure the state is `Failed` and the
    /// caller must `close()` the connection.
    pub async fn complete_handshake(&mut self) -> Result<(), TransportError> {
        if self.state != HandshakeState::AcceptedNoHandshake {
            return Err(TransportError::InvalidState {
                expected: "AcceptedNoHandshake",
                actual: self.state,
            });
        }
        self.negotiate_server().await
    }

    pub(crate) fn mark_accepted(&mut self) -> Result<(), TransportError> {
        self.transition(HandshakeState::AcceptedNoHandshake)
    }

    pub(crate) async fn negotiate_server(&mut self) -> Result<(), TransportError> {
        let context = match &self.tls {
            TlsSide::Server(context) => Some(context.clone()),
            TlsSide::Client(_) => None,
        };
        let Some(context) = context else {
            return Err(self.fail(TransportError::Protocol("not a server connection".to_string())));
        };
        self.transition(HandshakeState::Handshaking)?;

        let Io::Plain(tcp) = mem::replace(&mut self.io, Io::Detached) else {
            return Err(self.fail(TransportError::Protocol("no socket to handshake on".to_string())));
        };
        let limit = self.config.handshake_timeout;

        let accepted = {
            let server_config = context.handshake_guard().await;
            let acceptor = TlsAcceptor::from(server_config.clone());
            timeout(limit, acceptor.accept(tcp)).await
        };

        let stream = match accepted {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(self.fail(TransportError::TlsError(format!(
                    "handshake with {} failed: {err}",
                    display_addr(self.peer_addr)
                ))))
            }
            Err(_) => return Err(self.fail(TransportError::timeout("TLS handshake", limit))),
        };

        self.establish(TlsStream::Server(stream))
            .map_err(|err| self.fail(err))
    }

    fn ensure_established(&self) -> Result<(), TransportError> {
        match self.state {
            HandshakeState::Established => Ok(()),
            HandshakeState::Closed => Err(TransportError::Closed),
            actual => Err(TransportError::InvalidState {
                expected: "Established",
                actual,
            }),
        }
    }

    /// Reads at most `max_bytes`, bounded by the current timeout.
    pub async fn read(&mut self, max_bytes: usize) -> Result<Bytes, TransportError> {
        self.ensure_established()?;
        if self.read_buf.is_empty() {
            self.fill_buffer(max_bytes).await?;
        }
        let take = max_bytes.min(self.read_buf.len());
        Ok(self.read_buf.split_to(take).freeze())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_established()?;
        let limit = self.current_timeout;
        let Io::Tls(stream) = &mut self.io else {
            return Err(TransportError::Protocol("no TLS stream".to_string()));
        };

        let result = timeout(limit, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.fail(TransportError::IoError(err))),
            Err(_) => Err(self.fail(TransportError::timeout("write", limit))),
        }
    }

    async fn fill_buffer(&mut self, hint: usize) -> Result<usize, TransportError> {
        let limit = self.current_timeout;
        let Io::Tls(stream) = &mut self.io else {
            return Err(TransportError::Protocol("no TLS stream".to_string()));
        };

        self.read_buf.reserve(hint.clamp(1, READ_CHUNK));
        let result = timeout(limit, stream.read_buf(&mut self.read_buf)).await;

        match result {
            Ok(Ok(0)) => Err(self.fail(TransportError::PeerClosed)),
            Ok(Ok(read)) => Ok(read),
            Ok(Err(err)) => Err(self.fail(TransportError::IoError(err))),
            Err(_) => Err(self.fail(TransportError::timeout("read", limit))),
        }
    }

    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.ensure_established()?;
        let mut encoded = BytesMut::with_capacity(frame.len() + 4);
        self.codec
            .encode(frame, &mut encoded)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.write(&encoded).await
    }

    pub async fn receive_frame(&mut self) -> Result<Bytes, TransportError> {
        self.ensure_established()?;
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(frame)) => return Ok(frame.freeze()),
                Ok(None) => {}
                Err(err) => return Err(self.fail(TransportError::Protocol(err.to_string()))),
            }
            self.fill_buffer(READ_CHUNK).await?;
        }
    }

    /// Idempotent. Sends the TLS close_notify and shuts the socket down
    /// before releasing it; the TLS layer may still need the socket while
    /// shutting down.
    pub async fn close(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }

        let limit = self.config.handshake_timeout;
        match mem::replace(&mut self.io, Io::Detached) {
            Io::Tls(mut stream) => {
                if let Err(err) = shutdown_within(limit, stream.shutdown()).await {
                    debug!(peer = %display_addr(self.peer_addr), "TLS shutdown: {err}");
                }
                drop(stream);
            }
            Io::Plain(mut stream) => {
                if let Err(err) = shutdown_within(limit, stream.shutdown()).await {
                    debug!(peer = %display_addr(self.peer_addr), "Socket shutdown: {err}");
                }
                drop(stream);
            }
            Io::Detached => {}
        }

        self.read_buf.clear();
        let _ = self.transition(HandshakeState::Closed);
    }
}

impl Drop for SecureConnection {
    fn drop(&mut self) {
        if !matches!(self.io, Io::Detached) {
            warn!(
                peer = %display_addr(self.peer_addr),
                state = ?self.state,
                "SecureConnection dropped without close()"
            );
        }
    }
}

#[async_trait]
impl MessageChannel for SecureConnection {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        SecureConnection::send_frame(self, frame).await
    }

    async fn receive_frame(&mut self) -> Result<Bytes, TransportError> {
        SecureConnection::receive_frame(self).await
    }

    fn peer_credential(&self) -> Option<Arc<Credential>> {
        self.peer.clone()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

async fn shutdown_within<F>(limit: Duration, shutdown: F) -> Result<(), String>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match timeout(limit, shutdown).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!("timed out after {limit:?}")),
    }
}

async fn connect_tcp(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<(TcpStream, SocketAddr), TransportError> {
    let resolved = timeout(limit, lookup_host((host, port)))
        .await
        .map_err(|_| TransportError::timeout("name resolution", limit))?
        .map_err(|err| TransportError::ConnectionError(format!("cannot resolve {host}: {err}")))?;

    let mut addrs: Vec<SocketAddr> = resolved.collect();
    addrs.sort_by_key(|addr| !addr.is_ipv6());

    let mut last_error = None;
    for addr in addrs {
        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok((stream, addr)),
            Ok(Err(err)) => {
                debug!(%addr, "Connect attempt failed: {err}");
                last_error = Some(TransportError::ConnectionError(format!("{addr}: {err}")));
            }
            Err(_) => last_error = Some(TransportError::timeout("connect", limit)),
        }
    }

    Err(last_error
        .unwrap_or_else(|| TransportError::ConnectionError(format!("no addresses for {host}"))))
}

pub(crate) fn configure_socket(stream: &TcpStream, keepalive: bool) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    if keepalive {
        socket2::SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|addr| addr.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
