use std::time::Duration;
use thiserror::Error;

use crate::connection::HandshakeState;

/// Failures of the byte stream itself. Every variant is fatal to the
/// connection it was raised on; the owner must `close()` it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Connection error: connection is closed")]
    Closed,

    #[error("Invalid connection state: expected {expected}, found {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: HandshakeState,
    },

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("No usable CA certificates")]
    NoTrustAnchors,

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Client verifier rejected: {0}")]
    Verifier(String),
}

/// Raised while deriving a peer identity. A connection that produces one of
/// these never reaches `Established`.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Peer presented no certificate")]
    NoPeerCertificate,

    #[error("Unable to parse certificate {index} of the peer chain: {reason}")]
    Parse { index: usize, reason: String },

    #[error("Malformed {extension} extension: {reason}")]
    Extension {
        extension: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Transfer aborted by peer: {0}")]
    Aborted(String),

    #[error("Transfer integrity check failed: {0}")]
    Integrity(String),

    #[error("Transfer protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransferError {
    /// True when the byte stream can no longer be trusted to be in sync.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}

/// Request-level failures. These are reported back to the peer as
/// `S_ERROR` and leave the connection usable.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown method {0}")]
    UnknownMethod(String),

    #[error("Unknown message {0}")]
    UnknownMessage(String),

    #[error("Unknown connection callback {0}")]
    UnknownCallback(String),

    #[error("Unknown transfer direction {0}")]
    UnknownDirection(String),

    #[error("Service can't transfer files {0}")]
    TransferNotSupported(String),

    #[error("{name} expects at least {expected} arguments, got {actual}")]
    TooFewArguments {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Argument {position} of {name} has type {actual}, expected {expected}")]
    ArgumentType {
        name: String,
        position: usize,
        expected: String,
        actual: String,
    },

    #[error("Unauthorized query to {name}: {reason}")]
    Unauthorized { name: String, reason: String },

    #[error("Server error while serving {name}: {cause}")]
    HandlerFailed { name: String, cause: String },

    #[error("Handler for {name} returned a malformed result: {reason}")]
    MalformedResult { name: String, reason: String },

    #[error("Incomplete transfer")]
    IncompleteTransfer,
}
