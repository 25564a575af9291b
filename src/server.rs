use std::future::{pending, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{decode, send_message};
use crate::connection::{HandshakeState, SecureConnection};
use crate::dispatcher::{DispatcherState, RequestDispatcher};
use crate::errors::TransportError;
use crate::handler::ServiceHandler;
use crate::listener::TransportListener;
use crate::request::{ActionProposal, ActionType, ConnectionEvent};
use crate::response::Envelope;
use crate::tls::ServerTlsContext;

/// Where the TLS handshake of an accepted socket runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptMode {
    /// Accept on the listener task, handshake on the connection task.
    #[default]
    TwoStep,
    /// Accept and handshake on the listener task.
    OneStep,
}

/// Serves one [`ServiceHandler`] on a listener: one task per connection,
/// proposals answered strictly in arrival order.
pub struct ServiceServer {
    listener: TransportListener,
    dispatcher: RequestDispatcher,
    mode: AcceptMode,
}

impl ServiceServer {
    pub fn new(
        listener: TransportListener,
        handler: Arc<ServiceHandler>,
        state: Arc<DispatcherState>,
    ) -> Self {
        let chunk = listener.config().transfer_chunk_size;
        Self {
            listener,
            dispatcher: RequestDispatcher::new(handler, state).with_transfer_chunk_size(chunk),
            mode: AcceptMode::default(),
        }
    }

    pub fn with_accept_mode(mut self, mode: AcceptMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    /// The renewable TLS context shared with every accepted connection.
    pub fn tls_context(&self) -> Arc<ServerTlsContext> {
        self.listener.context().clone()
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub async fn serve(self) -> Result<(), TransportError> {
        self.serve_with_shutdown(pending()).await
    }

    /// Accepts until `shutdown` resolves, then closes every live connection
    /// and waits for their tasks.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = TaskTracker::new();
        tokio::pin!(shutdown);

        info!(
            service = %self.dispatcher.handler().name(),
            addr = %self.local_addr()?,
            mode = ?self.mode,
            "Serving"
        );

        let mut failures = 0u32;
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok(connection) => {
                    failures = 0;
                    tasks.spawn(serve_connection(
                        self.dispatcher.clone(),
                        connection,
                        stop_rx.clone(),
                    ));
                }
                // Socket-level failures such as EMFILE persist; pause before retrying.
                Err(err @ TransportError::IoError(_)) => {
                    let delay = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    warn!(retry_in = ?delay, "Accept failed: {err}");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => warn!("Accept failed: {err}"),
            }
        }

        info!(service = %self.dispatcher.handler().name(), "Shutting down");
        let _ = stop_tx.send(true);
        tasks.close();
        tasks.wait().await;
        Ok(())
    }

    async fn accept(&self) -> Result<SecureConnection, TransportError> {
        match self.mode {
            AcceptMode::TwoStep => self.listener.accept_raw().await,
            AcceptMode::OneStep => self.listener.accept_and_handshake().await,
        }
    }
}

const ACCEPT_BACKOFF_FIRST: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the `failures`-th consecutive failed accept: doubling from
/// 10ms, capped at one second.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_FIRST
        .saturating_mul(1u32 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Drives one connection from handshake to close.
async fn serve_connection(
    dispatcher: RequestDispatcher,
    mut connection: SecureConnection,
    mut stop: watch::Receiver<bool>,
) {
    if connection.state() != HandshakeState::Established {
        if let Err(err) = connection.complete_handshake().await {
            warn!("Handshake failed: {err}");
            connection.close().await;
            return;
        }
    }

    let credential = connection.peer_credential().cloned();
    let peer = connection.peer_addr();
    info!(
        peer = ?peer,
        dn = credential.as_ref().map(|c| c.identity_dn()).unwrap_or("<none>"),
        "Connection established"
    );

    let mut registered = false;
    loop {
        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = connection.receive_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::PeerClosed) => {
                debug!(peer = ?peer, "Peer closed the connection");
                break;
            }
            Err(err) => {
                warn!(peer = ?peer, "Dropping connection: {err}");
                break;
            }
        };

        let proposal: ActionProposal = match decode(&frame) {
            Ok(proposal) => proposal,
            Err(err) => {
                let reply = Envelope::error(format!("Malformed action proposal: {err}"));
                if let Err(err) = send_message(&mut connection, &reply.into_value()).await {
                    warn!(peer = ?peer, "Dropping connection: {err}");
                    break;
                }
                continue;
            }
        };

        match dispatcher.execute_action(&mut connection, proposal).await {
            Ok(outcome) if outcome.action == ActionType::Connection && outcome.is_ok() => {
                if outcome.name == ConnectionEvent::New.as_str() {
                    registered = true;
                } else if outcome.name == ConnectionEvent::Drop.as_str() {
                    registered = false;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(peer = ?peer, "Dropping connection: {err}");
                break;
            }
        }
    }

    connection.close().await;
    if registered {
        dispatcher.connection_dropped(credential, peer).await;
    }
}
