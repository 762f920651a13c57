use std::net::IpAddr;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509NameBuilder};

use super::types::{CaRoot, ForgedLeaf, TlsError, TlsErrorKind};

pub const LEAF_ORGANIZATION: &str = "Loxy mitm proxy";

/// 2050-01-01T00:00:00Z
const LEAF_NOT_AFTER: i64 = 2_524_608_000;

/// Signs a fresh leaf certificate for `host` (an optional `:port` is ignored).
///
/// The serial is the SHA-256 of the bare host, so the same host always gets
/// the same serial; the key pair is new on every call and mirrors the CA's key
/// algorithm.
pub fn forge_leaf(ca: &CaRoot, host: &str) -> Result<ForgedLeaf, TlsError> {
    let host = bare_host(host);
    let algorithm = ca.key_kind.leaf_algorithm()?;
    let key = algorithm.generate()?;

    let cert = build_leaf_cert(ca, host, &key)
        .map_err(|err| TlsError::new(TlsErrorKind::Signing, err.to_string()))?;

    Ok(ForgedLeaf {
        host: host.to_string(),
        cert,
        ca_cert: ca.cert.clone(),
        key,
    })
}

/// Strips a port suffix and IPv6 brackets: `[::1]:443` becomes `::1`,
/// `example.com:443` becomes `example.com`.
pub fn bare_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest);
    }
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

pub fn serial_for_host(host: &str) -> Result<BigNum, ErrorStack> {
    BigNum::from_slice(&openssl::sha::sha256(host.as_bytes()))
}

fn build_leaf_cert(ca: &CaRoot, host: &str, key: &PKey<Private>) -> Result<X509, ErrorStack> {
    let ip = host.parse::<IpAddr>().ok();

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, LEAF_ORGANIZATION)?;
    if ip.is_none() {
        name.append_entry_by_nid(Nid::COMMONNAME, host)?;
    }
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial_for_host(host)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_issuer_name(ca.cert.subject_name())?;
    builder.set_subject_name(&name)?;
    let not_before = Asn1Time::from_unix(0)?;
    let not_after = Asn1Time::from_unix(LEAF_NOT_AFTER)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let mut san = SubjectAlternativeName::new();
    match ip {
        Some(_) => san.ip(host),
        None => san.dns(host),
    };
    let san = san.build(&builder.x509v3_context(Some(&ca.cert), None))?;
    builder.append_extension(san)?;

    let authority_key_id = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(&ca.cert), None))?;
    builder.append_extension(authority_key_id)?;

    builder.sign(&ca.key, signing_digest(&ca.key))?;
    Ok(builder.build())
}

fn signing_digest(key: &PKey<Private>) -> MessageDigest {
    match (key.id(), key.bits()) {
        (openssl::pkey::Id::EC, bits) if bits > 384 => MessageDigest::sha512(),
        (openssl::pkey::Id::EC, bits) if bits > 256 => MessageDigest::sha384(),
        _ => MessageDigest::sha256(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{Id, PKey};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::{X509, X509NameBuilder, X509StoreContext};

    use super::{LEAF_ORGANIZATION, bare_host, forge_leaf, serial_for_host};
    use crate::tls::{CaRoot, ForgedLeaf, KeyAlgorithm, TlsErrorKind, generate_ca};

    fn ecdsa_ca() -> CaRoot {
        generate_ca("Loxy Test CA", KeyAlgorithm::EcdsaP256).unwrap()
    }

    fn ed25519_ca() -> CaRoot {
        let key = PKey::generate_ed25519().unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "Edwards CA").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::null()).unwrap();
        CaRoot::from_parts(builder.build(), key).unwrap()
    }

    fn verifies_against(leaf: &ForgedLeaf, root: &X509) -> bool {
        let mut store = X509StoreBuilder::new().unwrap();
        store.add_cert(root.clone()).unwrap();
        let store = store.build();
        let chain = Stack::new().unwrap();
        let mut context = X509StoreContext::new().unwrap();
        context
            .init(&store, &leaf.cert, &chain, |ctx| ctx.verify_cert())
            .unwrap()
    }

    fn common_names(cert: &X509) -> Vec<String> {
        cert.subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .map(|entry| entry.data().as_utf8().unwrap().to_string())
            .collect()
    }

    #[test]
    fn same_host_gets_same_serial_and_fresh_key() {
        let ca = ecdsa_ca();
        let first = forge_leaf(&ca, "example.test").unwrap();
        let second = forge_leaf(&ca, "example.test:443").unwrap();

        assert_eq!(first.serial().unwrap(), second.serial().unwrap());
        assert_ne!(
            first.key.public_key_to_der().unwrap(),
            second.key.public_key_to_der().unwrap()
        );
    }

    #[test]
    fn serial_is_sha256_of_bare_host() {
        let ca = ecdsa_ca();
        let leaf = forge_leaf(&ca, "example.test:8443").unwrap();
        let expected = serial_for_host("example.test").unwrap().to_vec();

        assert_eq!(leaf.serial().unwrap(), expected);
        assert_ne!(
            leaf.serial().unwrap(),
            forge_leaf(&ca, "other.test").unwrap().serial().unwrap()
        );
    }

    #[test]
    fn leaf_key_mirrors_ca_key_algorithm() {
        let rsa = generate_ca("RSA CA", KeyAlgorithm::Rsa2048).unwrap();
        let leaf = forge_leaf(&rsa, "example.test").unwrap();
        assert_eq!(leaf.key.id(), Id::RSA);
        assert_eq!(leaf.key.bits(), 2048);

        let leaf = forge_leaf(&ecdsa_ca(), "example.test").unwrap();
        assert_eq!(leaf.key.id(), Id::EC);
        let group = leaf.key.ec_key().unwrap().group().curve_name();
        assert_eq!(group, Some(Nid::X9_62_PRIME256V1));
    }

    #[test]
    fn unsupported_ca_key_yields_no_leaf() {
        let result = forge_leaf(&ed25519_ca(), "example.test");
        assert_matches!(result, Err(err) if err.kind == TlsErrorKind::UnsupportedKeyType);
    }

    #[test]
    fn dns_host_sets_san_and_common_name() {
        let leaf = forge_leaf(&ecdsa_ca(), "example.test:443").unwrap();

        let names = leaf.cert.subject_alt_names().unwrap();
        let dns: Vec<&str> = names.iter().filter_map(|name| name.dnsname()).collect();
        assert_eq!(dns, vec!["example.test"]);
        assert!(names.iter().all(|name| name.ipaddress().is_none()));
        assert_eq!(common_names(&leaf.cert), vec!["example.test".to_string()]);
    }

    #[test]
    fn ip_host_uses_ip_san_only() {
        let leaf = forge_leaf(&ecdsa_ca(), "127.0.0.1:443").unwrap();

        let names = leaf.cert.subject_alt_names().unwrap();
        let ips: Vec<&[u8]> = names.iter().filter_map(|name| name.ipaddress()).collect();
        assert_eq!(ips, vec![&[127u8, 0, 0, 1][..]]);
        assert!(names.iter().all(|name| name.dnsname().is_none()));
        assert!(common_names(&leaf.cert).is_empty());

        let leaf = forge_leaf(&ecdsa_ca(), "[::1]:8443").unwrap();
        let names = leaf.cert.subject_alt_names().unwrap();
        assert_eq!(
            names.iter().filter_map(|name| name.ipaddress()).count(),
            1
        );
    }

    #[test]
    fn leaf_carries_fixed_template_fields() {
        let ca = ecdsa_ca();
        let leaf = forge_leaf(&ca, "example.test").unwrap();

        let organization: Vec<String> = leaf
            .cert
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .map(|entry| entry.data().as_utf8().unwrap().to_string())
            .collect();
        assert_eq!(organization, vec![LEAF_ORGANIZATION.to_string()]);

        let epoch = Asn1Time::from_unix(0).unwrap();
        let diff = epoch.diff(leaf.cert.not_before()).unwrap();
        assert_eq!((diff.days, diff.secs), (0, 0));

        let text = String::from_utf8(leaf.cert.to_text().unwrap()).unwrap();
        assert!(text.contains("CA:FALSE"));
        assert!(text.contains("Digital Signature, Key Encipherment"));
        assert!(text.contains("TLS Web Server Authentication"));
        assert!(text.contains("2050"));

        let chain = leaf.chain_der().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], ca.certificate().to_der().unwrap());
    }

    #[test]
    fn chain_verifies_only_against_issuing_ca() {
        let ca = generate_ca("RSA CA", KeyAlgorithm::Rsa2048).unwrap();
        let leaf = forge_leaf(&ca, "example.test").unwrap();
        assert!(verifies_against(&leaf, ca.certificate()));

        let stranger = ecdsa_ca();
        assert!(!verifies_against(&leaf, stranger.certificate()));
    }

    #[test]
    fn bare_host_strips_ports_and_brackets() {
        assert_eq!(bare_host("example.test:443"), "example.test");
        assert_eq!(bare_host("example.test"), "example.test");
        assert_eq!(bare_host("[::1]:443"), "::1");
        assert_eq!(bare_host("::1"), "::1");
        assert_eq!(bare_host("10.0.0.1:80"), "10.0.0.1");
    }
}
