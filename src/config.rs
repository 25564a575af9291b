use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::ConfigError;

/// Socket and framing parameters shared by clients and services.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bounds connect, accept-to-handshake and the handshake itself.
    pub handshake_timeout: Duration,

    /// Bounds every read and write once the connection is established.
    pub rpc_timeout: Duration,

    pub keepalive: bool,

    pub max_frame_size: usize,

    pub transfer_chunk_size: usize,

    /// SNI / verification name; defaults to the host passed to `connect`.
    pub server_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(600),
            keepalive: true,
            max_frame_size: 16 * 1024 * 1024,
            transfer_chunk_size: 512 * 1024,
            server_name: None,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size.max(1);
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }
}

/// Certificate chain, key and trust anchors for one side of a connection.
#[derive(Debug)]
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub ca_roots: Vec<CertificateDer<'static>>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            ca_roots: self.ca_roots.clone(),
        }
    }
}

impl TlsMaterial {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        ca_roots: Vec<CertificateDer<'static>>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
            ca_roots,
        }
    }

    pub fn from_pem_files(
        cert_chain_path: &Path,
        private_key_path: &Path,
        ca_path: &Path,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            cert_chain: load_cert_chain(cert_chain_path)?,
            private_key: load_private_key(private_key_path)?,
            ca_roots: load_cert_chain(ca_path)?,
        })
    }
}

/// Where server material comes from, so a renewal knows what to re-read.
#[derive(Debug, Clone)]
pub enum TlsSource {
    Files {
        cert_chain: PathBuf,
        private_key: PathBuf,
        ca: PathBuf,
    },
    Memory(TlsMaterial),
}

impl TlsSource {
    pub fn files(
        cert_chain: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        ca: impl Into<PathBuf>,
    ) -> Self {
        Self::Files {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
            ca: ca.into(),
        }
    }

    pub fn load(&self) -> Result<TlsMaterial, ConfigError> {
        match self {
            Self::Files {
                cert_chain,
                private_key,
                ca,
            } => TlsMaterial::from_pem_files(cert_chain, private_key, ca),
            Self::Memory(material) => Ok(material.clone()),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
}

pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open(path)?;
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    if certificates.is_empty() {
        return Err(ConfigError::NoCertificates(path.display().to_string()));
    }
    Ok(certificates)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey(path.display().to_string()))
}
