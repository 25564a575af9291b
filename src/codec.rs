//! Payload encoding and the [`MessageChannel`] seam.
//!
//! Frames are length-delimited on the TLS stream; their contents are
//! MessagePack with named fields.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::credentials::Credential;
use crate::errors::TransportError;

pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    Ok(rmp_serde::from_slice(data)?)
}

/// A framed, authenticated message stream. `SecureConnection` is the
/// production implementation; the dispatcher only depends on this trait.
#[async_trait]
pub trait MessageChannel: Send {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Next complete frame. A clean end of stream is `PeerClosed`.
    async fn receive_frame(&mut self) -> Result<Bytes, TransportError>;

    fn peer_credential(&self) -> Option<Arc<Credential>>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

#[async_trait]
impl<T> MessageChannel for Box<T>
where
    T: MessageChannel + ?Sized,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        (**self).send_frame(frame).await
    }

    async fn receive_frame(&mut self) -> Result<Bytes, TransportError> {
        (**self).receive_frame().await
    }

    fn peer_credential(&self) -> Option<Arc<Credential>> {
        (**self).peer_credential()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

pub async fn send_message<C, T>(channel: &mut C, message: &T) -> Result<(), TransportError>
where
    C: MessageChannel + ?Sized,
    T: Serialize + Sync + ?Sized,
{
    let frame = encode(message)?;
    channel.send_frame(frame).await
}

pub async fn receive_message<C, T>(channel: &mut C) -> Result<T, TransportError>
where
    C: MessageChannel + ?Sized,
    T: DeserializeOwned,
{
    let frame = channel.receive_frame().await?;
    decode(&frame)
}
