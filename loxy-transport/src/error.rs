use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connect to {target} failed: {message}")]
    Connect { target: String, message: String },
    #[error("upstream TLS error: {0}")]
    Tls(String),
    #[error("upstream IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed upstream response: {0}")]
    Parse(String),
    #[error("upstream closed the connection before responding")]
    Closed,
    #[error("{0} timed out")]
    Timeout(&'static str),
}
