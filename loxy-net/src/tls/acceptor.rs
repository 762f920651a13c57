use openssl::ssl::{AlpnError, SslAcceptor, SslMethod, SslVerifyMode, select_next_proto};

use super::types::{ForgedLeaf, TlsError, TlsErrorKind};

const ALPN_HTTP11: &[u8] = b"\x08http/1.1";

/// Builds a TLS server context presenting `[leaf, ca]`.
///
/// Only HTTP/1.1 is offered over ALPN since the decrypted stream is parsed as
/// HTTP/1.x.
pub fn build_acceptor(leaf: &ForgedLeaf) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder
        .set_certificate(&leaf.cert)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .add_extra_chain_cert(leaf.ca_cert.clone())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .set_private_key(&leaf.key)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .check_private_key()
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(ALPN_HTTP11, client).ok_or(AlpnError::NOACK)
    });
    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}
