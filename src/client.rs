use std::path::{Path, PathBuf};
use std::time::Duration;

use rmpv::Value;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{receive_message, send_message, MessageChannel};
use crate::config::TransportConfig;
use crate::connection::SecureConnection;
use crate::errors::{TransferError, TransportError};
use crate::request::{ActionProposal, ConnectionEvent, TransferDescriptor, TransferDirection};
use crate::response::Envelope;
use crate::tls::ClientTlsContext;
use crate::transfer::{close_transfer, open_transfer, safe_entry_path, TransferItem, TransferSession};

/// Client end of one service connection. Calls are serialised on the
/// connection; a transport failure closes it.
pub struct RpcClient {
    connection: Mutex<SecureConnection>,
    chunk_size: usize,
}

impl RpcClient {
    pub async fn connect(
        host: &str,
        port: u16,
        tls: ClientTlsContext,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let chunk_size = config.transfer_chunk_size;
        let connection = SecureConnection::connect_to(host, port, tls, config).await?;
        Ok(Self::from_connection(connection, chunk_size))
    }

    pub fn from_connection(connection: SecureConnection, chunk_size: usize) -> Self {
        Self {
            connection: Mutex::new(connection),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Calls `method` and returns the handler's own envelope.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Envelope, TransportError> {
        Ok(self.call_timed(method, args).await?.0)
    }

    /// Like [`call`](Self::call), also returning the time the service spent
    /// in the handler. Refusals before the handler ran report zero.
    pub async fn call_timed(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(Envelope, Duration), TransportError> {
        let reply = self.exchange(ActionProposal::rpc(method, args)).await?;
        unwrap_timed(reply)
    }

    pub async fn send_message(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Envelope, TransportError> {
        let reply = self.exchange(ActionProposal::message(name, args)).await?;
        Ok(unwrap_timed(reply)?.0)
    }

    pub async fn connection_event(
        &self,
        event: ConnectionEvent,
        args: Vec<Value>,
    ) -> Result<Envelope, TransportError> {
        self.exchange(ActionProposal::connection(event, args)).await
    }

    /// Sends any proposal and returns the raw reply envelope.
    pub async fn exchange(&self, proposal: ActionProposal) -> Result<Envelope, TransportError> {
        let mut connection = self.connection.lock().await;
        let result = exchange_on(&mut *connection, &proposal).await;
        if result.is_err() {
            connection.close().await;
        }
        result
    }

    pub async fn send_file<R>(
        &self,
        descriptor: TransferDescriptor,
        source: &mut R,
    ) -> Result<Envelope, TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut connection = self.connection.lock().await;
        let result = upload(&mut *connection, self.chunk_size, &descriptor, source).await;
        close_if_fatal(&mut connection, result).await
    }

    /// Receives one file into `sink`.
    pub async fn receive_file<W>(
        &self,
        descriptor: TransferDescriptor,
        sink: &mut W,
    ) -> Result<Envelope, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut connection = self.connection.lock().await;
        let result = download(&mut *connection, self.chunk_size, &descriptor, sink).await;
        close_if_fatal(&mut connection, result).await
    }

    /// Uploads `files` as one bulk stream; each entry is named by the first
    /// element of its pair.
    pub async fn send_bulk(
        &self,
        descriptor: TransferDescriptor,
        files: &[(String, PathBuf)],
    ) -> Result<Envelope, TransferError> {
        let mut connection = self.connection.lock().await;
        let result = upload_bulk(&mut *connection, self.chunk_size, &descriptor, files).await;
        close_if_fatal(&mut connection, result).await
    }

    /// Downloads a bulk stream into `destination`, one file per entry.
    /// Files written by a failed transfer are removed again.
    pub async fn receive_bulk(
        &self,
        descriptor: TransferDescriptor,
        destination: &Path,
    ) -> Result<(Envelope, Vec<PathBuf>), TransferError> {
        let mut connection = self.connection.lock().await;
        let mut written = Vec::new();
        let result = download_bulk(
            &mut *connection,
            self.chunk_size,
            &descriptor,
            destination,
            &mut written,
        )
        .await;
        let result = close_if_fatal(&mut connection, result).await;

        if result.as_ref().map_or(true, |envelope| !envelope.is_ok()) {
            for path in written.drain(..) {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), "Leaving partial file: {err}");
                }
            }
        }
        result.map(|envelope| (envelope, written))
    }

    /// Asks the service what a bulk holds; the listing is the result value.
    pub async fn list_bulk(&self, descriptor: TransferDescriptor) -> Result<Envelope, TransferError> {
        let mut connection = self.connection.lock().await;
        let result = list(&mut *connection, self.chunk_size, &descriptor).await;
        close_if_fatal(&mut connection, result).await
    }

    pub async fn close(&self) {
        self.connection.lock().await.close().await;
    }
}

async fn exchange_on(
    channel: &mut dyn MessageChannel,
    proposal: &ActionProposal,
) -> Result<Envelope, TransportError> {
    send_message(channel, proposal).await?;
    let reply: Value = receive_message(channel).await?;
    Envelope::from_value(reply).map_err(|reason| TransportError::Protocol(format!("bad reply: {reason}")))
}

/// `S_OK([inner, elapsed])` into the inner envelope and the elapsed time.
fn unwrap_timed(reply: Envelope) -> Result<(Envelope, Duration), TransportError> {
    let value = match reply {
        Envelope::Ok(value) => value,
        refused @ Envelope::Error { .. } => return Ok((refused, Duration::ZERO)),
    };
    let Value::Array(mut pair) = value else {
        return Err(TransportError::Protocol("expected [result, elapsed]".to_string()));
    };
    if pair.len() != 2 {
        return Err(TransportError::Protocol(format!(
            "expected [result, elapsed], got {} elements",
            pair.len()
        )));
    }
    let elapsed = pair
        .pop()
        .and_then(|elapsed| elapsed.as_f64())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or_default();
    let inner = pair.pop().unwrap_or(Value::Nil);
    let inner = Envelope::from_value(inner)
        .map_err(|reason| TransportError::Protocol(format!("bad inner result: {reason}")))?;
    Ok((inner, elapsed))
}

async fn upload<R>(
    channel: &mut dyn MessageChannel,
    chunk_size: usize,
    descriptor: &TransferDescriptor,
    source: &mut R,
) -> Result<Envelope, TransferError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut session =
        match open_transfer(channel, TransferDirection::FromClient, descriptor, chunk_size).await? {
            Ok(session) => session,
            Err(refusal) => return Ok(refusal),
        };
    let driven = send_single(&mut session, source).await;
    conclude(session, driven).await
}

async fn send_single<R>(session: &mut TransferSession<'_>, source: &mut R) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    session.send_from_reader(source).await?;
    session.finish().await
}

async fn download<W>(
    channel: &mut dyn MessageChannel,
    chunk_size: usize,
    descriptor: &TransferDescriptor,
    sink: &mut W,
) -> Result<Envelope, TransferError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut session =
        match open_transfer(channel, TransferDirection::ToClient, descriptor, chunk_size).await? {
            Ok(session) => session,
            Err(refusal) => return Ok(refusal),
        };
    let driven = session.receive_to_writer(sink).await.map(|_| ());
    conclude(session, driven).await
}

async fn upload_bulk(
    channel: &mut dyn MessageChannel,
    chunk_size: usize,
    descriptor: &TransferDescriptor,
    files: &[(String, PathBuf)],
) -> Result<Envelope, TransferError> {
    let mut session =
        match open_transfer(channel, TransferDirection::BulkFromClient, descriptor, chunk_size).await? {
            Ok(session) => session,
            Err(refusal) => return Ok(refusal),
        };
    let driven = send_entries(&mut session, files).await;
    conclude(session, driven).await
}

async fn send_entries(
    session: &mut TransferSession<'_>,
    files: &[(String, PathBuf)],
) -> Result<(), TransferError> {
    for (name, path) in files {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        session.send_entry(name, Some(size)).await?;
        session.send_from_reader(&mut file).await?;
    }
    session.finish().await
}

async fn download_bulk(
    channel: &mut dyn MessageChannel,
    chunk_size: usize,
    descriptor: &TransferDescriptor,
    destination: &Path,
    written: &mut Vec<PathBuf>,
) -> Result<Envelope, TransferError> {
    let mut session =
        match open_transfer(channel, TransferDirection::BulkToClient, descriptor, chunk_size).await? {
            Ok(session) => session,
            Err(refusal) => return Ok(refusal),
        };
    let driven = receive_entries(&mut session, destination, written).await;
    conclude(session, driven).await
}

async fn list(
    channel: &mut dyn MessageChannel,
    chunk_size: usize,
    descriptor: &TransferDescriptor,
) -> Result<Envelope, TransferError> {
    match open_transfer(channel, TransferDirection::ListBulk, descriptor, chunk_size).await? {
        Ok(session) => close_transfer(session).await,
        Err(refusal) => Ok(refusal),
    }
}

async fn receive_entries(
    session: &mut TransferSession<'_>,
    destination: &Path,
    written: &mut Vec<PathBuf>,
) -> Result<(), TransferError> {
    let mut current: Option<File> = None;
    while let Some(item) = session.receive().await? {
        match item {
            TransferItem::Entry { name, .. } => {
                if let Some(mut file) = current.take() {
                    file.flush().await?;
                }
                let path = safe_entry_path(destination, &name)?;
                current = Some(File::create(&path).await?);
                written.push(path);
            }
            TransferItem::Chunk(data) => match current.as_mut() {
                Some(file) => file.write_all(&data).await?,
                None => return Err(TransferError::Protocol("data before the first entry".to_string())),
            },
        }
    }
    if let Some(mut file) = current {
        file.flush().await?;
    }
    Ok(())
}

/// Brings the stream to its end after the client side finished or gave up,
/// then reads the service's result.
async fn conclude(
    mut session: TransferSession<'_>,
    driven: Result<(), TransferError>,
) -> Result<Envelope, TransferError> {
    match driven {
        Ok(()) => close_transfer(session).await,
        Err(err) if err.is_fatal() => Err(err),
        Err(TransferError::Aborted(reason)) => {
            debug!("Service aborted the transfer: {reason}");
            close_transfer(session).await
        }
        Err(err) => {
            session.settle(&err.to_string()).await?;
            let answer = close_transfer(session).await?;
            warn!(answer = ?answer, "Transfer failed locally: {err}");
            Err(err)
        }
    }
}

async fn close_if_fatal<T>(
    connection: &mut SecureConnection,
    result: Result<T, TransferError>,
) -> Result<T, TransferError> {
    if matches!(&result, Err(err) if err.is_fatal()) {
        connection.close().await;
    }
    result
}
