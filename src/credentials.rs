//! Peer identity derived from a completed handshake.
//!
//! Extraction is a pure function of the presented chain and fails closed:
//! any certificate or extension that cannot be decoded yields an error and no
//! credential at all.

use rustls::pki_types::CertificateDer;
use x509_parser::der_parser::ber::BerObjectContent;
use x509_parser::der_parser::der::{parse_der, DerObject};
use x509_parser::der_parser::oid::Oid;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use crate::errors::CredentialError;

const OID_PROXY_CERT_INFO: &str = "1.3.6.1.5.5.7.1.14";
const OID_PROXY_CERT_INFO_DRAFT: &str = "1.3.6.1.4.1.3536.1.222";
// 1.3.6.1.4.1.3536.1.1.1.9, compared in encoded form.
const LIMITED_PROXY_POLICY: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x9b, 0x50, 0x01, 0x01, 0x01, 0x09];
const OID_DIRAC_GROUP: &str = "1.2.42.42";
const OID_VOMS_AC_SEQUENCE: &str = "1.3.6.1.4.1.8005.100.100.5";

const MAX_DER_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    subject_dn: String,
    issuer_dn: String,
    identity_dn: String,
    issuer_chain: Vec<String>,
    group: Option<String>,
    voms_attributes: Vec<String>,
    is_proxy: bool,
    is_limited_proxy: bool,
    not_after: i64,
}

impl Credential {
    /// Subject of the leaf certificate.
    pub fn subject_dn(&self) -> &str {
        &self.subject_dn
    }

    pub fn issuer_dn(&self) -> &str {
        &self.issuer_dn
    }

    /// Subject of the first non-proxy certificate, i.e. the user or host the
    /// proxies were delegated from.
    pub fn identity_dn(&self) -> &str {
        &self.identity_dn
    }

    /// Issuer DN of every presented certificate, leaf first.
    pub fn issuer_chain(&self) -> &[String] {
        &self.issuer_chain
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// VOMS FQANs, e.g. `/dirac/Role=production/Capability=NULL`.
    pub fn voms_attributes(&self) -> &[String] {
        &self.voms_attributes
    }

    pub fn roles(&self) -> Vec<&str> {
        self.voms_attributes
            .iter()
            .filter_map(|fqan| {
                fqan.split('/')
                    .find_map(|part| part.strip_prefix("Role="))
                    .filter(|role| !role.is_empty() && *role != "NULL")
            })
            .collect()
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub fn is_limited_proxy(&self) -> bool {
        self.is_limited_proxy
    }

    /// Expiry of the leaf certificate, seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }
}

struct ChainLink {
    subject: String,
    issuer: String,
    proxy: ProxyKind,
    group: Option<String>,
    voms: Vec<String>,
    not_after: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    NotProxy,
    Full,
    Limited,
}

/// Builds a [`Credential`] from a peer chain, leaf first.
pub fn extract_credential(chain: &[CertificateDer<'_>]) -> Result<Credential, CredentialError> {
    if chain.is_empty() {
        return Err(CredentialError::NoPeerCertificate);
    }

    let links = chain
        .iter()
        .enumerate()
        .map(|(index, der)| parse_link(index, der.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let leaf = &links[0];
    let identity_dn = links
        .iter()
        .find(|link| link.proxy == ProxyKind::NotProxy)
        .unwrap_or(&links[links.len() - 1])
        .subject
        .clone();

    // Group and VOMS attributes live on the most recent delegation that
    // carries them.
    let group = links.iter().find_map(|link| link.group.clone());
    let voms_attributes = links
        .iter()
        .find(|link| !link.voms.is_empty())
        .map(|link| link.voms.clone())
        .unwrap_or_default();

    Ok(Credential {
        subject_dn: leaf.subject.clone(),
        issuer_dn: leaf.issuer.clone(),
        identity_dn,
        issuer_chain: links.iter().map(|link| link.issuer.clone()).collect(),
        group,
        voms_attributes,
        is_proxy: leaf.proxy != ProxyKind::NotProxy,
        is_limited_proxy: links.iter().any(|link| link.proxy == ProxyKind::Limited),
        not_after: leaf.not_after,
    })
}

fn parse_link(index: usize, der: &[u8]) -> Result<ChainLink, CredentialError> {
    let (_remaining, cert) = X509Certificate::from_der(der).map_err(|err| CredentialError::Parse {
        index,
        reason: err.to_string(),
    })?;

    let subject = slash_dn(cert.subject()).map_err(|reason| CredentialError::Parse { index, reason })?;
    let issuer = slash_dn(cert.issuer()).map_err(|reason| CredentialError::Parse { index, reason })?;

    let mut proxy = legacy_proxy_kind(&subject, &issuer);
    let mut group = None;
    let mut voms = Vec::new();

    for extension in cert.extensions() {
        match extension.oid.to_id_string().as_str() {
            OID_PROXY_CERT_INFO | OID_PROXY_CERT_INFO_DRAFT => {
                proxy = proxy_policy(extension.value)?;
            }
            OID_DIRAC_GROUP => {
                group = Some(first_string(extension.value).map_err(|reason| {
                    CredentialError::Extension {
                        extension: "DIRAC group",
                        reason,
                    }
                })?);
            }
            OID_VOMS_AC_SEQUENCE => {
                voms = fqans(extension.value).map_err(|reason| CredentialError::Extension {
                    extension: "VOMS",
                    reason,
                })?;
            }
            _ => {}
        }
    }

    Ok(ChainLink {
        subject,
        issuer,
        proxy,
        group,
        voms,
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Renders a name as `/O=DIRAC/OU=Users/CN=alice`, in encoded order.
fn slash_dn(name: &X509Name<'_>) -> Result<String, String> {
    let mut dn = String::new();
    for rdn in name.iter_rdn() {
        for attribute in rdn.iter() {
            let oid = attribute.attr_type().to_id_string();
            let value = attribute
                .as_str()
                .map_err(|err| format!("attribute {oid} is not a string: {err}"))?;
            dn.push('/');
            dn.push_str(attribute_abbrev(&oid).unwrap_or(&oid));
            dn.push('=');
            dn.push_str(value);
        }
    }
    Ok(dn)
}

fn attribute_abbrev(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "0.9.2342.19200300.100.1.1" => "UID",
        "0.9.2342.19200300.100.1.25" => "DC",
        "1.2.840.113549.1.9.1" => "emailAddress",
        _ => return None,
    })
}

/// Pre-RFC 3820 proxies append `CN=proxy` or `CN=limited proxy` to the
/// issuer's subject.
fn legacy_proxy_kind(subject: &str, issuer: &str) -> ProxyKind {
    let Some(rest) = subject.strip_prefix(issuer) else {
        return ProxyKind::NotProxy;
    };
    match rest {
        "/CN=proxy" => ProxyKind::Full,
        "/CN=limited proxy" => ProxyKind::Limited,
        _ => ProxyKind::NotProxy,
    }
}

fn proxy_policy(value: &[u8]) -> Result<ProxyKind, CredentialError> {
    let mut oids = Vec::new();
    visit_der(value, 0, &mut |leaf| {
        if let DerLeaf::Oid(oid) = leaf {
            oids.push(oid);
        }
        Ok(())
    })
    .map_err(|reason| CredentialError::Extension {
        extension: "proxyCertInfo",
        reason,
    })?;

    if oids.iter().any(|oid| oid.as_bytes() == LIMITED_PROXY_POLICY) {
        Ok(ProxyKind::Limited)
    } else {
        Ok(ProxyKind::Full)
    }
}

fn first_string(value: &[u8]) -> Result<String, String> {
    let mut found = None;
    visit_der(value, 0, &mut |leaf| {
        if let (true, DerLeaf::Text(text)) = (found.is_none(), leaf) {
            found = Some(text.to_string());
        }
        Ok(())
    })?;
    found.ok_or_else(|| "no string value".to_string())
}

/// FQANs are octet strings starting with `/` nested inside the attribute
/// certificates of the extension.
fn fqans(value: &[u8]) -> Result<Vec<String>, String> {
    let mut fqans = Vec::new();
    visit_der(value, 0, &mut |leaf| {
        if let DerLeaf::Octets(content) = leaf {
            if content.first() == Some(&b'/') {
                let text = std::str::from_utf8(content)
                    .map_err(|err| format!("FQAN is not UTF-8: {err}"))?;
                fqans.push(text.to_string());
            }
        }
        Ok(())
    })?;
    Ok(fqans)
}

/// Primitive values the extension decoders care about.
enum DerLeaf<'a> {
    Oid(Oid<'a>),
    Octets(&'a [u8]),
    Text(&'a str),
}

/// Parses every DER object in `data` and visits its primitive leaves,
/// descending into sequences, sets and tagged values.
fn visit_der<'a>(
    mut data: &'a [u8],
    depth: usize,
    visit: &mut dyn FnMut(DerLeaf<'a>) -> Result<(), String>,
) -> Result<(), String> {
    if depth > MAX_DER_DEPTH {
        return Err("DER nesting too deep".to_string());
    }
    while !data.is_empty() {
        let (rest, object) = parse_der(data).map_err(|err| err.to_string())?;
        visit_object(object, depth, visit)?;
        data = rest;
    }
    Ok(())
}

fn visit_object<'a>(
    object: DerObject<'a>,
    depth: usize,
    visit: &mut dyn FnMut(DerLeaf<'a>) -> Result<(), String>,
) -> Result<(), String> {
    match object.content {
        BerObjectContent::Sequence(items) | BerObjectContent::Set(items) => {
            for item in items {
                visit_object(item, depth + 1, visit)?;
            }
            Ok(())
        }
        BerObjectContent::Tagged(_, _, inner) => visit_object(*inner, depth + 1, visit),
        BerObjectContent::Unknown(any) if any.header.is_constructed() => {
            visit_der(any.data, depth + 1, visit)
        }
        BerObjectContent::OID(oid) => visit(DerLeaf::Oid(oid)),
        BerObjectContent::OctetString(content) => visit(DerLeaf::Octets(content)),
        BerObjectContent::UTF8String(text)
        | BerObjectContent::PrintableString(text)
        | BerObjectContent::IA5String(text)
        | BerObjectContent::VisibleString(text) => visit(DerLeaf::Text(text)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn der(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut encoded = vec![tag, content.len() as u8];
        encoded.extend_from_slice(content);
        encoded
    }

    #[test]
    fn limited_policy_is_detected() {
        let info = der(0x30, &der(0x30, &der(0x06, LIMITED_PROXY_POLICY)));
        assert_eq!(proxy_policy(&info).unwrap(), ProxyKind::Limited);

        let inherit_all = [0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x15, 0x01];
        let info = der(0x30, &der(0x30, &der(0x06, &inherit_all)));
        assert_eq!(proxy_policy(&info).unwrap(), ProxyKind::Full);
    }

    #[test]
    fn policy_with_large_top_arcs_is_full() {
        // 2.100.3: the first two arcs share one multi-byte subidentifier.
        let info = der(0x30, &der(0x30, &der(0x06, &[0x81, 0x34, 0x03])));
        assert_eq!(proxy_policy(&info).unwrap(), ProxyKind::Full);
    }

    #[test]
    fn path_length_and_policy_body_are_skipped() {
        // SEQUENCE { INTEGER 1, SEQUENCE { OID, OCTET STRING } }
        let mut policy = der(0x06, LIMITED_PROXY_POLICY);
        policy.extend(der(0x04, b"policy"));
        let mut info = der(0x02, &[0x01]);
        info.extend(der(0x30, &policy));
        assert_eq!(proxy_policy(&der(0x30, &info)).unwrap(), ProxyKind::Limited);
    }

    #[test]
    fn malformed_proxy_info_fails_closed() {
        let err = proxy_policy(&[0x30, 0x04, 0x06, 0x09]).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Extension {
                extension: "proxyCertInfo",
                ..
            }
        ));
    }

    #[test]
    fn legacy_proxy_names_are_recognised() {
        let issuer = "/O=DIRAC/CN=alice";
        assert_eq!(legacy_proxy_kind("/O=DIRAC/CN=alice/CN=proxy", issuer), ProxyKind::Full);
        assert_eq!(
            legacy_proxy_kind("/O=DIRAC/CN=alice/CN=limited proxy", issuer),
            ProxyKind::Limited
        );
        assert_eq!(legacy_proxy_kind("/O=DIRAC/CN=bob", issuer), ProxyKind::NotProxy);
    }

    #[test]
    fn truncated_extension_is_rejected() {
        assert!(fqans(&[0x30, 0x05, 0x04, 0x01]).is_err());
        assert!(first_string(&[0x0c, 0x05, b'a']).is_err());
    }

    #[test]
    fn fqans_are_found_in_nested_structures() {
        let fqan = b"/dirac/Role=production/Capability=NULL";
        let sequence = der(0x30, &der(0xa0, &der(0x04, fqan)));

        assert_eq!(
            fqans(&sequence).unwrap(),
            vec!["/dirac/Role=production/Capability=NULL".to_string()]
        );
    }

    #[test]
    fn non_utf8_fqan_fails_closed() {
        let sequence = der(0x30, &der(0x04, &[b'/', 0xff, 0xfe]));
        assert!(fqans(&sequence).is_err());
    }

    #[test]
    fn group_is_the_first_string() {
        let value = der(0x0c, b"dirac_admin");
        assert_eq!(first_string(&value).unwrap(), "dirac_admin");
        assert!(first_string(&der(0x30, &[])).is_err());
    }

    #[test]
    fn empty_chain_has_no_credential() {
        assert!(matches!(
            extract_credential(&[]),
            Err(CredentialError::NoPeerCertificate)
        ));
    }

    #[test]
    fn garbage_certificate_fails_closed() {
        let garbage = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01]);
        assert!(matches!(
            extract_credential(&[garbage]),
            Err(CredentialError::Parse { index: 0, .. })
        ));
    }
}
