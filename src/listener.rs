use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::connection::SecureConnection;
use crate::errors::{ConfigError, TransportError};
use crate::tls::ServerTlsContext;

/// Turns a listening socket into server-side [`SecureConnection`]s.
///
/// Reactor-style servers call [`accept_raw`](Self::accept_raw) on the
/// accept loop and finish the handshake on the per-connection task; simple
/// servers use [`accept_and_handshake`](Self::accept_and_handshake).
pub struct TransportListener {
    listener: TcpListener,
    context: Arc<ServerTlsContext>,
    config: TransportConfig,
}

impl TransportListener {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        context: Arc<ServerTlsContext>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Listening for secure connections");
        Ok(Self {
            listener,
            context,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ServerTlsContext> {
        &self.context
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Accepts a TCP connection without negotiating TLS. The returned
    /// connection is `AcceptedNoHandshake` and bound by the handshake
    /// timeout.
    pub async fn accept_raw(&self) -> Result<SecureConnection, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        crate::connection::configure_socket(&stream, self.config.keepalive)?;
        debug!(peer = %peer_addr, "Accepted TCP connection");

        let mut connection =
            SecureConnection::server(stream, peer_addr, self.context.clone(), self.config.clone());
        connection.mark_accepted()?;
        Ok(connection)
    }

    /// Accepts and negotiates TLS on the calling task. A connection whose
    /// handshake fails is closed before the error is returned.
    pub async fn accept_and_handshake(&self) -> Result<SecureConnection, TransportError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        crate::connection::configure_socket(&stream, self.config.keepalive)?;

        let mut connection =
            SecureConnection::server(stream, peer_addr, self.context.clone(), self.config.clone());
        if let Err(err) = connection.negotiate_server().await {
            connection.close().await;
            return Err(err);
        }
        Ok(connection)
    }

    /// Reloads certificate and CA material for future handshakes. Waits for
    /// in-flight handshakes on this listener to finish first; established
    /// connections are unaffected.
    pub async fn renew_server_context(&self) -> Result<u64, ConfigError> {
        self.context.renew().await
    }
}
