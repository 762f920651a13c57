use std::fs;
use std::path::{Path, PathBuf};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509, X509NameBuilder};

use super::types::{CaKeyKind, CaRoot, KeyAlgorithm, TlsError, TlsErrorKind};

const DEFAULT_CA_VALIDITY_DAYS: u32 = 3650;

impl CaRoot {
    /// Reads a PEM certificate and PEM private key from disk.
    ///
    /// When the certificate file holds a chain, the first certificate is the CA.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert_pem = fs::read(cert_path).map_err(|err| {
            TlsError::new(TlsErrorKind::Io, format!("{}: {err}", cert_path.display()))
        })?;
        let key_pem = fs::read(key_path).map_err(|err| {
            TlsError::new(TlsErrorKind::Io, format!("{}: {err}", key_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::stack_from_pem(cert_pem)
            .map_err(|err| TlsError::new(TlsErrorKind::CertificateParse, err.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TlsError::new(TlsErrorKind::CertificateParse, "no certificate in PEM data")
            })?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|err| TlsError::new(TlsErrorKind::CertificateParse, err.to_string()))?;
        Self::from_parts(cert, key)
    }

    pub fn from_parts(cert: X509, key: PKey<Private>) -> Result<Self, TlsError> {
        let public = cert
            .public_key()
            .map_err(|err| TlsError::new(TlsErrorKind::CertificateParse, err.to_string()))?;
        if !public.public_eq(&key) {
            return Err(TlsError::new(
                TlsErrorKind::CertificateParse,
                "private key does not match certificate",
            ));
        }
        let key_kind = CaKeyKind::classify(&key);
        Ok(Self {
            cert,
            key,
            key_kind,
        })
    }

    pub fn key_kind(&self) -> &CaKeyKind {
        &self.key_kind
    }

    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    pub fn to_pem(&self) -> Result<CaMaterial, TlsError> {
        let cert_pem = self
            .cert
            .to_pem()
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
        let key_pem = self
            .key
            .private_key_to_pem_pkcs8()
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
        Ok(CaMaterial { cert_pem, key_pem })
    }
}

#[derive(Debug)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl KeyAlgorithm {
    pub fn generate(self) -> Result<PKey<Private>, TlsError> {
        let key = match self {
            KeyAlgorithm::Rsa2048 => Rsa::generate(2048).and_then(PKey::from_rsa),
            KeyAlgorithm::EcdsaP256 => EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
                .and_then(|group| EcKey::generate(&group))
                .and_then(PKey::from_ec_key),
        };
        key.map_err(|err| TlsError::new(TlsErrorKind::Signing, err.to_string()))
    }
}

/// Mints a self-signed CA, for users who do not have one yet.
pub fn generate_ca(common_name: &str, algorithm: KeyAlgorithm) -> Result<CaRoot, TlsError> {
    let key = algorithm.generate()?;
    let cert = build_ca_cert(common_name, &key)
        .map_err(|err| TlsError::new(TlsErrorKind::Signing, err.to_string()))?;
    CaRoot::from_parts(cert, key)
}

fn build_ca_cert(
    common_name: &str,
    key: &PKey<Private>,
) -> Result<X509, openssl::error::ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Loxy")?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(DEFAULT_CA_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let subject_key_id =
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

pub fn write_ca_to_dir(
    dir: impl AsRef<Path>,
    material: &CaMaterial,
) -> Result<CaMaterialPaths, TlsError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    let cert_path = dir.join("loxy-ca.pem");
    let key_path = dir.join("loxy-ca-key.pem");

    fs::write(&cert_path, &material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&key_path, &material.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    Ok(CaMaterialPaths {
        cert_path,
        key_path,
    })
}
