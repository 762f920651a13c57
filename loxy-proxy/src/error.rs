use loxy_net::TlsError;
use loxy_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate error: {0}")]
    Tls(#[from] TlsError),
    #[error("upstream error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed request: {0}")]
    Parse(String),
    #[error("client connection cannot be taken over")]
    HijackUnsupported,
    #[error("invalid tunnel target {0:?}")]
    InvalidTarget(String),
    #[error("timed out {0}")]
    Timeout(&'static str),
}
