use openssl::pkey::{Id, PKey, Private};
use openssl::x509::X509;
use thiserror::Error;

/// The trust anchor every forged leaf chains to. Read-only once loaded.
pub struct CaRoot {
    pub(crate) cert: X509,
    pub(crate) key: PKey<Private>,
    pub(crate) key_kind: CaKeyKind,
}

impl std::fmt::Debug for CaRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaRoot")
            .field("subject", &self.cert.subject_name())
            .field("key_kind", &self.key_kind)
            .finish_non_exhaustive()
    }
}

/// CA key algorithm, classified once when the CA is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaKeyKind {
    Rsa,
    Ecdsa,
    Unsupported(String),
}

impl CaKeyKind {
    pub(crate) fn classify(key: &PKey<Private>) -> Self {
        match key.id() {
            Id::RSA => CaKeyKind::Rsa,
            Id::EC => CaKeyKind::Ecdsa,
            Id::ED25519 => CaKeyKind::Unsupported("ed25519".to_string()),
            Id::ED448 => CaKeyKind::Unsupported("ed448".to_string()),
            Id::DSA => CaKeyKind::Unsupported("dsa".to_string()),
            other => CaKeyKind::Unsupported(format!("pkey id {}", other.as_raw())),
        }
    }

    /// Algorithm of the key pairs generated for leaves signed by this CA.
    pub fn leaf_algorithm(&self) -> Result<KeyAlgorithm, TlsError> {
        match self {
            CaKeyKind::Rsa => Ok(KeyAlgorithm::Rsa2048),
            CaKeyKind::Ecdsa => Ok(KeyAlgorithm::EcdsaP256),
            CaKeyKind::Unsupported(name) => Err(TlsError::new(
                TlsErrorKind::UnsupportedKeyType,
                format!("unsupported CA key type: {name}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    EcdsaP256,
}

/// A short-lived leaf certificate for one intercepted host.
pub struct ForgedLeaf {
    pub host: String,
    pub cert: X509,
    pub ca_cert: X509,
    pub key: PKey<Private>,
}

impl ForgedLeaf {
    /// DER encodings of `[leaf, ca]`.
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>, TlsError> {
        let leaf = self
            .cert
            .to_der()
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
        let ca = self
            .ca_cert
            .to_der()
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
        Ok(vec![leaf, ca])
    }

    pub fn serial(&self) -> Result<Vec<u8>, TlsError> {
        self.cert
            .serial_number()
            .to_bn()
            .map(|serial| serial.to_vec())
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))
    }
}

impl std::fmt::Debug for ForgedLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgedLeaf")
            .field("host", &self.host)
            .field("subject", &self.cert.subject_name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    CertificateParse,
    UnsupportedKeyType,
    Signing,
    Io,
    OpenSsl,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
