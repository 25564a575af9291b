#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use diset::{
    AcceptMode, ClientTlsContext, DispatcherState, RpcClient, ServerTlsContext, ServiceHandler,
    ServiceServer, TlsMaterial, TransportConfig, TransportError, TransportListener,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const GROUP_OID: &[u64] = &[1, 2, 42, 42];
pub const VOMS_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 8005, 100, 100, 5];
pub const PROXY_CERT_INFO_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 14];

/// A throw-away CA issuing host and user certificates.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

pub struct Issued {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl Issued {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key.serialize_der()).into()
    }
}

fn name(parts: &[(DnType, &str)]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (kind, value) in parts {
        dn.push(kind.clone(), *value);
    }
    dn
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = name(&[
            (DnType::OrganizationName, "DIRAC"),
            (DnType::CommonName, "DIRAC Test CA"),
        ]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn host(&self, host: &str) -> Issued {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.distinguished_name = name(&[
            (DnType::OrganizationName, "DIRAC"),
            (DnType::CommonName, host),
        ]);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        self.sign(params)
    }

    pub fn user(&self, cn: &str, extensions: Vec<CustomExtension>) -> Issued {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = name(&[
            (DnType::OrganizationName, "DIRAC"),
            (DnType::OrganizationalUnitName, "Users"),
            (DnType::CommonName, cn),
        ]);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.custom_extensions = extensions;
        self.sign(params)
    }

    fn sign(&self, params: CertificateParams) -> Issued {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Issued { cert, key }
    }

    pub fn material(&self, issued: &Issued) -> TlsMaterial {
        TlsMaterial::new(vec![issued.der()], issued.private_key(), vec![self.ca_der()])
    }
}

/// A proxy signed by a user certificate, its subject being the user's DN
/// with one more CN appended.
pub fn delegate(
    user_cn: &str,
    user: &Issued,
    proxy_cn: &str,
    extensions: Vec<CustomExtension>,
) -> Issued {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = name(&[
        (DnType::OrganizationName, "DIRAC"),
        (DnType::OrganizationalUnitName, "Users"),
        (DnType::CommonName, user_cn),
        // A second CN; rcgen keys plain CommonName entries uniquely.
        (DnType::CustomDnType(vec![2, 5, 4, 3]), proxy_cn),
    ]);
    params.custom_extensions = extensions;
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &user.cert, &user.key).unwrap();
    Issued { cert, key }
}

/// DIRAC group extension value: a UTF8String.
pub fn group_extension(group: &str) -> CustomExtension {
    let mut content = vec![0x0c, group.len() as u8];
    content.extend_from_slice(group.as_bytes());
    CustomExtension::from_oid_content(GROUP_OID, content)
}

/// Minimal VOMS extension carrying `fqans` as octet strings inside a
/// tagged sequence, the way attribute certificates nest them.
pub fn voms_extension(fqans: &[&str]) -> CustomExtension {
    let mut octets = Vec::new();
    for fqan in fqans {
        octets.push(0x04);
        octets.push(fqan.len() as u8);
        octets.extend_from_slice(fqan.as_bytes());
    }
    let mut tagged = vec![0xa0, octets.len() as u8];
    tagged.extend(octets);
    let mut sequence = vec![0x30, tagged.len() as u8];
    sequence.extend(tagged);
    CustomExtension::from_oid_content(VOMS_OID, sequence)
}

/// RFC 3820 proxyCertInfo with the given policy language OID.
pub fn proxy_extension(policy_oid_der: &[u8]) -> CustomExtension {
    let mut oid = vec![0x06, policy_oid_der.len() as u8];
    oid.extend_from_slice(policy_oid_der);
    let mut policy = vec![0x30, oid.len() as u8];
    policy.extend(oid);
    let mut info = vec![0x30, policy.len() as u8];
    info.extend(policy);
    CustomExtension::from_oid_content(PROXY_CERT_INFO_OID, info)
}

pub fn test_config() -> TransportConfig {
    TransportConfig::new()
        .with_handshake_timeout(Duration::from_secs(5))
        .with_rpc_timeout(Duration::from_secs(10))
        .with_transfer_chunk_size(4)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub context: Arc<ServerTlsContext>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), TransportError>>,
}

impl TestServer {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

pub async fn start_test_server(
    pki: &TestPki,
    handler: Arc<ServiceHandler>,
    state: Arc<DispatcherState>,
    mode: AcceptMode,
) -> TestServer {
    let host = pki.host("localhost");
    let context = Arc::new(ServerTlsContext::from_material(pki.material(&host)).unwrap());
    let listener = TransportListener::bind("127.0.0.1:0", context.clone(), test_config())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let server = ServiceServer::new(listener, handler, state).with_accept_mode(mode);
    let handle = tokio::spawn(server.serve_with_shutdown(async move {
        let _ = stopped.await;
    }));

    sleep(Duration::from_millis(10)).await;
    TestServer {
        addr,
        context,
        stop: Some(stop),
        handle,
    }
}

pub fn client_tls(pki: &TestPki, user: &Issued) -> ClientTlsContext {
    ClientTlsContext::new(pki.material(user)).unwrap()
}

pub async fn connect(pki: &TestPki, server: &TestServer, user: &Issued) -> RpcClient {
    RpcClient::connect(
        "127.0.0.1",
        server.addr.port(),
        client_tls(pki, user),
        test_config().with_server_name("localhost"),
    )
    .await
    .unwrap()
}

pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("test timed out")
}
