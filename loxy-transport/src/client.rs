use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use loxy_net::{BodyFraming, Limits, ParseStatus, ResponseHead, ResponseParser};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::body::{Body, Release};
use crate::error::TransportError;
use crate::pool::{Pool, PoolKey};
use crate::request::Request;
use crate::response::Response;
use crate::stream::UpstreamStream;

/// Sends one request upstream and returns its response as soon as the head
/// has arrived. The body streams from the origin as it is read.
///
/// Implementations are shared by every proxy session and must be safe for
/// concurrent use.
pub trait RoundTrip: Send + Sync + 'static {
    fn round_trip(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Bounds sending the request and receiving the response head.
    pub request_timeout: Duration,
    /// Bounds each read of a response body.
    pub body_idle_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub verify_upstream_tls: bool,
    pub limits: Limits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            body_idle_timeout: Duration::from_secs(60),
            pool_idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 8,
            verify_upstream_tls: true,
            limits: Limits::default(),
        }
    }
}

/// Pooled HTTP/1.1 client speaking plain TCP or TLS to origins.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    connector: SslConnector,
    pool: Arc<Pool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let mut connector = SslConnector::builder(SslMethod::tls_client())
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        connector
            .set_alpn_protos(b"\x08http/1.1")
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        if !config.verify_upstream_tls {
            connector.set_verify(SslVerifyMode::NONE);
        }
        let pool = Arc::new(Pool::new(config.max_idle_per_host, config.pool_idle_timeout));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connector: connector.build(),
                pool,
            }),
        })
    }

    pub async fn request(&self, request: Request) -> Result<Response, TransportError> {
        timeout(self.inner.config.request_timeout, self.execute(request))
            .await
            .map_err(|_| TransportError::Timeout("upstream request"))?
    }

    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let key = pool_key(&request)?;
        let bytes = request.encode()?;

        while let Some(mut stream) = self.inner.pool.checkout(&key).await {
            if !still_open(&mut stream).await {
                debug!(upstream = %key, "dropping idle connection closed by origin");
                continue;
            }
            match self.exchange(&key, stream, &request, &bytes).await {
                Ok(response) => return Ok(response),
                Err(Failure::Unsent) => {
                    debug!(upstream = %key, "pooled connection went stale, redialing");
                }
                Err(Failure::Sent(TransportError::Closed)) if is_idempotent(&request.method) => {
                    debug!(upstream = %key, "pooled connection closed without answering, retrying");
                }
                Err(Failure::Sent(err)) => return Err(err),
            }
            break;
        }

        let stream = self.connect(&key).await?;
        self.exchange(&key, stream, &request, &bytes)
            .await
            .map_err(Failure::into_error)
    }

    async fn exchange(
        &self,
        key: &PoolKey,
        mut stream: UpstreamStream,
        request: &Request,
        bytes: &[u8],
    ) -> Result<Response, Failure> {
        match stream.write_all(bytes).await {
            Err(err) if is_reset(&err) => return Err(Failure::Unsent),
            other => other.map_err(|err| Failure::Sent(err.into()))?,
        }
        stream
            .flush()
            .await
            .map_err(|err| Failure::Sent(err.into()))?;

        let config = &self.inner.config;
        let (head, buffered) = read_head(&mut stream, &request.method, config.limits)
            .await
            .map_err(Failure::Sent)?;
        let reusable = head.framing != BodyFraming::UntilClose
            && head.line.status_code != 101
            && !head.wants_close()
            && !wants_close(request);
        let release = reusable.then(|| Release {
            pool: Arc::clone(&self.inner.pool),
            key: key.clone(),
        });

        let body = Body::upstream(stream, buffered, head.framing, config.body_idle_timeout, release).await;
        Response::from_head(head, body).map_err(Failure::Sent)
    }

    async fn connect(&self, key: &PoolKey) -> Result<UpstreamStream, TransportError> {
        let config = &self.inner.config;
        let tcp = timeout(
            config.connect_timeout,
            TcpStream::connect((key.host.as_str(), key.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout("upstream connect"))?
        .map_err(|err| TransportError::Connect {
            target: key.to_string(),
            message: err.to_string(),
        })?;
        let _ = tcp.set_nodelay(true);

        if !key.tls {
            return Ok(UpstreamStream::Plain(tcp));
        }

        let ssl = self
            .inner
            .connector
            .configure()
            .and_then(|configuration| {
                configuration
                    .verify_hostname(config.verify_upstream_tls)
                    .into_ssl(&key.host)
            })
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        let mut tls =
            SslStream::new(ssl, tcp).map_err(|err| TransportError::Tls(err.to_string()))?;
        timeout(config.handshake_timeout, Pin::new(&mut tls).connect())
            .await
            .map_err(|_| TransportError::Timeout("upstream TLS handshake"))?
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        Ok(UpstreamStream::Tls(Box::new(tls)))
    }
}

impl RoundTrip for Client {
    fn round_trip(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send {
        self.request(request)
    }
}

fn pool_key(request: &Request) -> Result<PoolKey, TransportError> {
    let uri = &request.uri;
    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        other => {
            return Err(TransportError::InvalidRequest(format!(
                "unsupported scheme {other:?} in {uri}"
            )));
        }
    };
    let host = uri
        .host()
        .ok_or_else(|| TransportError::InvalidRequest(format!("missing host in {uri}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(PoolKey { tls, host, port })
}

fn wants_close(request: &Request) -> bool {
    request
        .headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

fn is_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Why an exchange on one connection failed.
enum Failure {
    /// The connection was already closed when the request was written.
    Unsent,
    /// The request may have reached the origin.
    Sent(TransportError),
}

impl Failure {
    fn into_error(self) -> TransportError {
        match self {
            Failure::Unsent => TransportError::Closed,
            Failure::Sent(err) => err,
        }
    }
}

/// Methods that may be sent a second time after the origin dropped the
/// connection without answering.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

/// An idle connection is only reusable while the origin has neither closed
/// it nor sent anything unasked.
async fn still_open(stream: &mut UpstreamStream) -> bool {
    let mut scratch = [0u8; 1];
    timeout(Duration::ZERO, stream.read(&mut scratch)).await.is_err()
}

/// Reads up to the end of the final response head, skipping interim `1xx`
/// responses. Returns the head and any body bytes read along with it.
async fn read_head<S>(
    stream: &mut S,
    method: &Method,
    limits: Limits,
) -> Result<(ResponseHead, Vec<u8>), TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseParser::with_limits(limits).for_method(method.as_str());
    let mut buffer = vec![0u8; 8192];
    let mut received_any = false;
    let mut status = parser.push_head(&[]);

    loop {
        match status {
            ParseStatus::Complete { message, .. } => {
                let code = message.line.status_code;
                if (100..200).contains(&code) && code != 101 {
                    status = parser.push_head(&[]);
                    continue;
                }
                return Ok((message, parser.take_buffered()));
            }
            ParseStatus::Error { error, .. } => {
                return Err(TransportError::Parse(error.to_string()));
            }
            ParseStatus::NeedMore { .. } => {}
        }

        let n = match stream.read(&mut buffer).await {
            Ok(n) => n,
            Err(err) if !received_any && is_reset(&err) => return Err(TransportError::Closed),
            Err(err) => return Err(err.into()),
        };
        if n == 0 {
            if received_any {
                return Err(TransportError::Parse(
                    "connection closed inside the response head".to_string(),
                ));
            }
            return Err(TransportError::Closed);
        }
        received_any = true;
        status = parser.push_head(&buffer[..n]);
    }
}
