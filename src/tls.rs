//! rustls configuration for both ends of a connection.
//!
//! Both sides authenticate: the service requires a client certificate that
//! chains to its CA roots, and the client verifies the service the same way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::config::{TlsMaterial, TlsSource};
use crate::errors::ConfigError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(ca_roots: &[rustls::pki_types::CertificateDer<'static>]) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(ca_roots.iter().cloned());
    if added == 0 {
        return Err(ConfigError::NoTrustAnchors);
    }
    Ok(roots)
}

fn build_server_config(material: TlsMaterial) -> Result<Arc<ServerConfig>, ConfigError> {
    let provider = provider();
    let roots = root_store(&material.ca_roots)?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|err| ConfigError::Verifier(err.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.cert_chain, material.private_key)?;

    Ok(Arc::new(config))
}

/// Server-side TLS state shared by a listener and every connection it
/// accepted.
///
/// Handshakes hold a read guard for their whole negotiation and
/// [`renew`](Self::renew) takes the write guard, so material is never swapped
/// underneath an in-flight `complete_handshake`. Established connections keep
/// the configuration they negotiated with.
pub struct ServerTlsContext {
    source: TlsSource,
    config: RwLock<Arc<ServerConfig>>,
    generation: AtomicU64,
}

impl ServerTlsContext {
    pub fn new(source: TlsSource) -> Result<Self, ConfigError> {
        let config = build_server_config(source.load()?)?;
        Ok(Self {
            source,
            config: RwLock::new(config),
            generation: AtomicU64::new(0),
        })
    }

    pub fn from_material(material: TlsMaterial) -> Result<Self, ConfigError> {
        Self::new(TlsSource::Memory(material))
    }

    /// Re-reads the configured source for future handshakes.
    pub async fn renew(&self) -> Result<u64, ConfigError> {
        let mut config = self.config.write().await;
        *config = build_server_config(self.source.load()?)?;
        Ok(self.bump_generation())
    }

    /// Replaces the material for future handshakes.
    pub async fn renew_with(&self, material: TlsMaterial) -> Result<u64, ConfigError> {
        let mut config = self.config.write().await;
        *config = build_server_config(material)?;
        Ok(self.bump_generation())
    }

    /// Number of renewals performed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) async fn handshake_guard(&self) -> RwLockReadGuard<'_, Arc<ServerConfig>> {
        self.config.read().await
    }

    fn bump_generation(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Renewed server TLS context");
        generation
    }
}

/// Client-side TLS configuration: our certificate plus the CAs we trust.
#[derive(Clone)]
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
}

impl ClientTlsContext {
    pub fn new(material: TlsMaterial) -> Result<Self, ConfigError> {
        let roots = root_store(&material.ca_roots)?;
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(material.cert_chain, material.private_key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_source(source: &TlsSource) -> Result<Self, ConfigError> {
        Self::new(source.load()?)
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }
}
