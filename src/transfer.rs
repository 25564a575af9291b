//! The file-transfer sub-protocol, multiplexed over the RPC connection.
//!
//! After a `FileTransfer/<direction>` proposal the client sends a
//! [`TransferDescriptor`] and the service answers `S_OK("Accepted")` or
//! `S_ERROR`. When accepted, the sending side streams [`TransferFrame`]s:
//!
//! ```text
//! single file:  Data* End
//! bulk:         (Entry Data*)* End
//! either:       ... Abort          (sender gave up; stream is over)
//! ```
//!
//! `End` carries the byte count and hex SHA-256 of everything sent. The
//! service then sends the final result envelope. `listBulk` moves no bytes;
//! its listing is the result value.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::codec::{receive_message, send_message, MessageChannel};
use crate::dispatcher::{guard_handler, shape_result, ActionOutcome, AuthorizationRequest, RequestDispatcher};
use crate::errors::{DispatchError, TransferError, TransportError};
use crate::handler::CallContext;
use crate::locks::MethodLockTable;
use crate::request::{ActionType, TransferDescriptor, TransferDirection};
use crate::response::Envelope;

pub const ACCEPTED: &str = "Accepted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferFrame {
    Entry { name: String, size: Option<u64> },
    Data(Bytes),
    End { bytes: u64, digest: String },
    Abort { reason: String },
}

/// What a receiving session yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferItem {
    Entry { name: String, size: Option<u64> },
    Chunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Sender,
    Receiver,
    /// `listBulk`: no payload stream.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Open,
    Finished,
    Aborted,
}

struct OpenEntry {
    name: String,
    size: Option<u64>,
    bytes: u64,
}

/// One side of a payload stream. Tracks the running byte count and SHA-256
/// and knows whether the stream has been completed, which is what keeps
/// the connection in sync for the next action.
pub struct TransferSession<'a> {
    channel: &'a mut dyn MessageChannel,
    role: SessionRole,
    direction: TransferDirection,
    declared_size: Option<u64>,
    declared_digest: Option<String>,
    chunk_size: usize,
    hasher: Sha256,
    bytes: u64,
    entry: Option<OpenEntry>,
    progress: Progress,
    broken: Option<String>,
}

impl<'a> TransferSession<'a> {
    pub(crate) fn new(
        channel: &'a mut dyn MessageChannel,
        role: SessionRole,
        direction: TransferDirection,
        descriptor: &TransferDescriptor,
        chunk_size: usize,
    ) -> Self {
        Self {
            channel,
            role,
            direction,
            declared_size: descriptor.size,
            declared_digest: descriptor.digest.clone(),
            chunk_size: chunk_size.max(1),
            hasher: Sha256::new(),
            bytes: 0,
            entry: None,
            progress: Progress::Open,
            broken: None,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Size promised by the descriptor, if any.
    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    /// True once the stream is over in both peers' view: `End` or `Abort`
    /// was sent or received. An idle session is always finished.
    pub fn finished_transmission(&self) -> bool {
        self.role == SessionRole::Idle || self.progress != Progress::Open
    }

    pub fn was_aborted(&self) -> bool {
        self.progress == Progress::Aborted
    }

    fn expect_role(&self, role: SessionRole) -> Result<(), TransferError> {
        if self.role != role {
            return Err(TransferError::Protocol(format!(
                "{:?} session cannot act as {role:?}",
                self.role
            )));
        }
        if self.progress != Progress::Open {
            return Err(TransferError::Protocol("transfer stream already finished".to_string()));
        }
        Ok(())
    }

    async fn send(&mut self, frame: &TransferFrame) -> Result<(), TransferError> {
        let sent = send_message(&mut *self.channel, frame).await;
        sent.map_err(|err| self.broke(err))
    }

    async fn next_frame(&mut self) -> Result<TransferFrame, TransferError> {
        let received = receive_message(&mut *self.channel).await;
        received.map_err(|err| self.broke(err))
    }

    fn broke(&mut self, err: TransportError) -> TransferError {
        self.broken = Some(err.to_string());
        TransferError::Transport(err)
    }

    /// Starts the next file of a bulk stream.
    pub async fn send_entry(&mut self, name: &str, size: Option<u64>) -> Result<(), TransferError> {
        self.expect_role(SessionRole::Sender)?;
        if !self.direction.is_bulk() {
            return Err(TransferError::Protocol(format!(
                "{} carries a single file",
                self.direction
            )));
        }
        self.send(&TransferFrame::Entry {
            name: name.to_string(),
            size,
        })
        .await
    }

    pub async fn send_chunk(&mut self, data: Bytes) -> Result<(), TransferError> {
        self.expect_role(SessionRole::Sender)?;
        if data.is_empty() {
            return Ok(());
        }
        self.hasher.update(&data);
        self.bytes += data.len() as u64;
        self.send(&TransferFrame::Data(data)).await
    }

    /// Streams `reader` to its end in chunks; returns the bytes sent.
    pub async fn send_from_reader<R>(&mut self, reader: &mut R) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut sent = 0;
        loop {
            let mut buf = BytesMut::with_capacity(self.chunk_size);
            let read = reader.read_buf(&mut buf).await?;
            if read == 0 {
                return Ok(sent);
            }
            sent += read as u64;
            self.send_chunk(buf.freeze()).await?;
        }
    }

    /// Closes the stream with its byte count and digest.
    pub async fn finish(&mut self) -> Result<(), TransferError> {
        self.expect_role(SessionRole::Sender)?;
        let digest = hex::encode(self.hasher.clone().finalize());
        self.send(&TransferFrame::End {
            bytes: self.bytes,
            digest,
        })
        .await?;
        self.progress = Progress::Finished;
        Ok(())
    }

    /// Tells the receiver nothing more is coming.
    pub async fn abort(&mut self, reason: &str) -> Result<(), TransferError> {
        self.expect_role(SessionRole::Sender)?;
        self.send(&TransferFrame::Abort {
            reason: reason.to_string(),
        })
        .await?;
        self.progress = Progress::Aborted;
        Ok(())
    }

    /// Next entry header or chunk; `None` after a verified `End`.
    pub async fn receive(&mut self) -> Result<Option<TransferItem>, TransferError> {
        if self.role == SessionRole::Receiver && self.progress != Progress::Open {
            return Ok(None);
        }
        self.expect_role(SessionRole::Receiver)?;

        match self.next_frame().await? {
            TransferFrame::Entry { name, size } => {
                if !self.direction.is_bulk() {
                    return Err(self.desync(format!("entry {name} in a single-file transfer")));
                }
                self.close_entry()?;
                self.entry = Some(OpenEntry {
                    name: name.clone(),
                    size,
                    bytes: 0,
                });
                Ok(Some(TransferItem::Entry { name, size }))
            }
            TransferFrame::Data(data) => {
                if self.direction.is_bulk() && self.entry.is_none() {
                    return Err(self.desync("data before the first entry".to_string()));
                }
                self.hasher.update(&data);
                self.bytes += data.len() as u64;
                if let Some(entry) = &mut self.entry {
                    entry.bytes += data.len() as u64;
                }
                Ok(Some(TransferItem::Chunk(data)))
            }
            TransferFrame::End { bytes, digest } => {
                self.progress = Progress::Finished;
                self.close_entry()?;
                self.verify(bytes, &digest)?;
                Ok(None)
            }
            TransferFrame::Abort { reason } => {
                self.progress = Progress::Aborted;
                Err(TransferError::Aborted(reason))
            }
        }
    }

    fn desync(&mut self, reason: String) -> TransferError {
        self.broken = Some(reason.clone());
        TransferError::Protocol(reason)
    }

    fn close_entry(&mut self) -> Result<(), TransferError> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };
        match entry.size {
            Some(size) if size != entry.bytes => Err(TransferError::Integrity(format!(
                "{} declared {size} bytes, received {}",
                entry.name, entry.bytes
            ))),
            _ => Ok(()),
        }
    }

    fn verify(&self, claimed_bytes: u64, claimed_digest: &str) -> Result<(), TransferError> {
        if claimed_bytes != self.bytes {
            return Err(TransferError::Integrity(format!(
                "sender counted {claimed_bytes} bytes, received {}",
                self.bytes
            )));
        }
        if let Some(size) = self.declared_size {
            if size != self.bytes {
                return Err(TransferError::Integrity(format!(
                    "declared {size} bytes, received {}",
                    self.bytes
                )));
            }
        }
        let digest = hex::encode(self.hasher.clone().finalize());
        if !digest.eq_ignore_ascii_case(claimed_digest) {
            return Err(TransferError::Integrity("content hash mismatch".to_string()));
        }
        if let Some(declared) = &self.declared_digest {
            if !digest.eq_ignore_ascii_case(declared) {
                return Err(TransferError::Integrity(
                    "content hash does not match the declared digest".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Receives a single-file stream into `writer`; returns the byte count.
    pub async fn receive_to_writer<W>(&mut self, writer: &mut W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        while let Some(item) = self.receive().await? {
            match item {
                TransferItem::Chunk(data) => writer.write_all(&data).await?,
                TransferItem::Entry { name, .. } => {
                    return Err(TransferError::Protocol(format!("unexpected bulk entry {name}")))
                }
            }
        }
        writer.flush().await?;
        Ok(self.bytes)
    }

    /// Receives a whole single-file stream into memory.
    pub async fn receive_to_end(&mut self) -> Result<Bytes, TransferError> {
        let mut buf = Vec::new();
        self.receive_to_writer(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Discards whatever the sender still has in flight, up to its `End` or
    /// `Abort`.
    pub async fn drain(&mut self) -> Result<u64, TransferError> {
        let mut discarded = 0;
        while self.role == SessionRole::Receiver && self.progress == Progress::Open {
            match self.next_frame().await? {
                TransferFrame::Data(data) => discarded += data.len() as u64,
                TransferFrame::Entry { .. } => {}
                TransferFrame::End { .. } => self.progress = Progress::Finished,
                TransferFrame::Abort { .. } => self.progress = Progress::Aborted,
            }
        }
        Ok(discarded)
    }

    /// Puts the stream back in sync after a handler stopped early: a
    /// sender aborts, a receiver drains.
    pub(crate) async fn settle(&mut self, reason: &str) -> Result<(), TransportError> {
        if let Some(lost) = &self.broken {
            return Err(TransportError::Protocol(format!("transfer stream lost: {lost}")));
        }
        if self.finished_transmission() {
            return Ok(());
        }
        let settled = match self.role {
            SessionRole::Sender => self.abort(reason).await,
            SessionRole::Receiver => self.drain().await.map(|_| ()),
            SessionRole::Idle => Ok(()),
        };
        match settled {
            Ok(()) => Ok(()),
            Err(TransferError::Transport(err)) => Err(err),
            Err(err) => Err(TransportError::Protocol(err.to_string())),
        }
    }
}

fn role_for(direction: TransferDirection, serving: bool) -> SessionRole {
    if direction == TransferDirection::ListBulk {
        SessionRole::Idle
    } else if direction.server_receives() == serving {
        SessionRole::Receiver
    } else {
        SessionRole::Sender
    }
}

/// Service half of a transfer, called by the dispatcher for
/// `FileTransfer` proposals.
pub(crate) async fn serve_transfer(
    dispatcher: &RequestDispatcher,
    channel: &mut dyn MessageChannel,
    ctx: CallContext,
) -> Result<ActionOutcome, TransportError> {
    let name = ctx.name.clone();
    let descriptor: TransferDescriptor = receive_message(channel).await?;
    let reply = |response: Envelope| ActionOutcome {
        action: ActionType::FileTransfer,
        name: name.clone(),
        response,
        elapsed: Duration::ZERO,
    };

    let refused = match name.parse::<TransferDirection>() {
        Err(unknown) => Err(DispatchError::UnknownDirection(unknown)),
        Ok(direction) => match dispatcher.handler().transfer(direction) {
            None => Err(DispatchError::TransferNotSupported(direction.to_string())),
            Some(handler) => {
                let request = AuthorizationRequest {
                    service: dispatcher.handler().name(),
                    action: ActionType::FileTransfer,
                    name: direction.as_str(),
                    auth_tag: None,
                    credential: ctx.credential.as_deref(),
                };
                dispatcher.state().authorize(&request).map(|()| (direction, handler))
            }
        },
    };
    let (direction, handler) = match refused {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(service = %dispatcher.handler().name(), "{err}");
            let response = Envelope::from(err);
            send_message(channel, &response.clone().into_value()).await?;
            return Ok(reply(response));
        }
    };

    let state = dispatcher.state().clone();
    let _guard = state
        .locks()
        .acquire(MethodLockTable::transfer_key(dispatcher.handler().name(), direction.as_str()))
        .await;
    send_message(channel, &Envelope::ok(ACCEPTED).into_value()).await?;

    let mut session = TransferSession::new(
        channel,
        role_for(direction, true),
        direction,
        &descriptor,
        dispatcher.transfer_chunk_size(),
    );
    let started = Instant::now();
    let result = {
        let handler = &handler;
        let session = &mut session;
        guard_handler(direction.as_str(), move || handler.transfer(ctx, descriptor, session)).await
    };
    let elapsed = started.elapsed();

    let response = match result {
        Ok(value) if !session.finished_transmission() => {
            debug!(%direction, "Handler returned with the stream still open: {value:?}");
            session.settle("incomplete transfer").await?;
            DispatchError::IncompleteTransfer.into()
        }
        Ok(value) => match shape_result(direction.as_str(), Ok(value)) {
            Ok(value) => Envelope::from_value(value).unwrap_or_else(Envelope::error),
            Err(err) => err.into(),
        },
        Err(cause) => {
            session.settle(&cause).await?;
            let err = DispatchError::HandlerFailed {
                name: direction.to_string(),
                cause,
            };
            error!(service = %dispatcher.handler().name(), "{err}");
            err.into()
        }
    };
    let bytes = session.bytes_transferred();
    drop(session);

    info!(
        service = %dispatcher.handler().name(),
        %direction,
        bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        ok = response.is_ok(),
        "Served transfer"
    );
    send_message(channel, &response.clone().into_value()).await?;
    Ok(ActionOutcome {
        action: ActionType::FileTransfer,
        name,
        response,
        elapsed,
    })
}

/// Client half of a transfer: proposal, descriptor, acceptance. Returns the
/// refusal envelope when the service declined.
pub(crate) async fn open_transfer<'a>(
    channel: &'a mut dyn MessageChannel,
    direction: TransferDirection,
    descriptor: &TransferDescriptor,
    chunk_size: usize,
) -> Result<Result<TransferSession<'a>, Envelope>, TransferError> {
    send_message(channel, &crate::request::ActionProposal::transfer(direction)).await?;
    send_message(channel, descriptor).await?;
    let answer: Value = receive_message(channel).await?;
    let answer = Envelope::from_value(answer)
        .map_err(|reason| TransferError::Protocol(format!("bad transfer acknowledgement: {reason}")))?;
    if !answer.is_ok() {
        return Ok(Err(answer));
    }
    Ok(Ok(TransferSession::new(
        channel,
        role_for(direction, false),
        direction,
        descriptor,
        chunk_size,
    )))
}

/// Reads the service's final envelope once the stream is over.
pub(crate) async fn close_transfer(session: TransferSession<'_>) -> Result<Envelope, TransferError> {
    if !session.finished_transmission() {
        return Err(TransferError::Protocol("transfer stream still open".to_string()));
    }
    let answer: Value = receive_message(session.channel).await?;
    Envelope::from_value(answer)
        .map_err(|reason| TransferError::Protocol(format!("bad transfer result: {reason}")))
}

/// Bulk entry names become single path components under the destination.
pub(crate) fn safe_entry_path(root: &Path, name: &str) -> Result<PathBuf, TransferError> {
    let relative = Path::new(name);
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => Ok(root.join(part)),
        _ => Err(TransferError::Protocol(format!("refusing bulk entry name {name:?}"))),
    }
}

/// Hex SHA-256 of `data`, as carried by `End` frames and descriptors.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
