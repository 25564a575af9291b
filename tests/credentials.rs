mod common;

use common::{delegate, group_extension, proxy_extension, voms_extension, TestPki};
use diset::{extract_credential, CredentialError};

// 1.3.6.1.4.1.3536.1.1.1.9 and 1.3.6.1.5.5.7.21.1
const LIMITED_POLICY: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x9b, 0x50, 0x01, 0x01, 0x01, 0x09];
const INHERIT_ALL_POLICY: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x15, 0x01];

#[test]
fn plain_user_certificate() {
    let pki = TestPki::new();
    let user = pki.user("alice", vec![]);

    let credential = extract_credential(&[user.der()]).unwrap();
    assert_eq!(credential.subject_dn(), "/O=DIRAC/OU=Users/CN=alice");
    assert_eq!(credential.identity_dn(), credential.subject_dn());
    assert_eq!(credential.issuer_dn(), "/O=DIRAC/CN=DIRAC Test CA");
    assert_eq!(credential.issuer_chain(), ["/O=DIRAC/CN=DIRAC Test CA".to_string()]);
    assert!(!credential.is_proxy());
    assert!(!credential.is_limited_proxy());
    assert_eq!(credential.group(), None);
    assert!(credential.voms_attributes().is_empty());
    assert!(credential.not_after() > 0);
}

#[test]
fn group_and_voms_attributes() {
    let pki = TestPki::new();
    let user = pki.user(
        "alice",
        vec![
            group_extension("dirac_prod"),
            voms_extension(&[
                "/dirac/Role=production/Capability=NULL",
                "/dirac/Role=NULL/Capability=NULL",
            ]),
        ],
    );

    let credential = extract_credential(&[user.der()]).unwrap();
    assert_eq!(credential.group(), Some("dirac_prod"));
    assert_eq!(credential.voms_attributes().len(), 2);
    assert_eq!(credential.roles(), vec!["production"]);
}

#[test]
fn rfc3820_limited_proxy_resolves_to_user_identity() {
    let pki = TestPki::new();
    let user = pki.user("alice", vec![]);
    let proxy = delegate(
        "alice",
        &user,
        "12345",
        vec![proxy_extension(LIMITED_POLICY), group_extension("dirac_user")],
    );

    let credential = extract_credential(&[proxy.der(), user.der()]).unwrap();
    assert!(credential.is_proxy());
    assert!(credential.is_limited_proxy());
    assert_eq!(credential.subject_dn(), "/O=DIRAC/OU=Users/CN=alice/CN=12345");
    assert_eq!(credential.issuer_dn(), "/O=DIRAC/OU=Users/CN=alice");
    assert_eq!(credential.identity_dn(), "/O=DIRAC/OU=Users/CN=alice");
    assert_eq!(credential.group(), Some("dirac_user"));
    assert_eq!(credential.issuer_chain().len(), 2);
}

#[test]
fn rfc3820_full_proxy_is_not_limited() {
    let pki = TestPki::new();
    let user = pki.user("alice", vec![]);
    let proxy = delegate("alice", &user, "67890", vec![proxy_extension(INHERIT_ALL_POLICY)]);

    let credential = extract_credential(&[proxy.der(), user.der()]).unwrap();
    assert!(credential.is_proxy());
    assert!(!credential.is_limited_proxy());
    assert_eq!(credential.identity_dn(), "/O=DIRAC/OU=Users/CN=alice");
}

#[test]
fn legacy_proxy_names() {
    let pki = TestPki::new();
    let user = pki.user("alice", vec![]);

    let full = delegate("alice", &user, "proxy", vec![]);
    let credential = extract_credential(&[full.der(), user.der()]).unwrap();
    assert!(credential.is_proxy());
    assert!(!credential.is_limited_proxy());

    let limited = delegate("alice", &user, "limited proxy", vec![]);
    let credential = extract_credential(&[limited.der(), user.der()]).unwrap();
    assert!(credential.is_limited_proxy());
    assert_eq!(credential.identity_dn(), "/O=DIRAC/OU=Users/CN=alice");
}

#[test]
fn undecodable_chain_yields_no_credential() {
    let pki = TestPki::new();
    let user = pki.user("alice", vec![]);
    let mut truncated = user.der().to_vec();
    truncated.truncate(truncated.len() / 2);

    let err = extract_credential(&[user.der(), truncated.into()]).unwrap_err();
    assert!(matches!(err, CredentialError::Parse { index: 1, .. }));
}

#[test]
fn undecodable_voms_attribute_yields_no_credential() {
    let pki = TestPki::new();
    let fqan = [b'/', b'd', 0xff, 0xfe];
    let mut octets = vec![0x04, fqan.len() as u8];
    octets.extend_from_slice(&fqan);
    let mut sequence = vec![0x30, octets.len() as u8];
    sequence.extend(octets);
    let user = pki.user(
        "alice",
        vec![rcgen::CustomExtension::from_oid_content(common::VOMS_OID, sequence)],
    );

    let err = extract_credential(&[user.der()]).unwrap_err();
    assert!(matches!(err, CredentialError::Extension { extension: "VOMS", .. }));
}
