use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri};
use loxy_net::{CaRoot, Header, HttpVersion, Limits};
use loxy_transport::{Request, Response, RoundTrip, strip_hop_by_hop};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::conn::ClientConn;
use crate::error::ProxyError;
use crate::mitm;
use crate::tunnel::{normalize_target, splice};

/// Written on the raw socket once a CONNECT has been taken over.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Intercept CONNECT tunnels with forged certificates instead of
    /// splicing bytes.
    pub mitm: bool,
    pub default_port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub tunnel_linger: Duration,
    pub limits: Limits,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for HandlerOptions {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            mitm: config.mitm.enabled,
            default_port: config.tunnel.default_port,
            connect_timeout: config.timeouts.connect(),
            handshake_timeout: config.timeouts.handshake(),
            idle_timeout: config.timeouts.idle(),
            tunnel_linger: config.timeouts.tunnel_linger(),
            limits: config.http_limits(),
        }
    }
}

/// Serves proxy requests: relays plain HTTP through the shared transport and
/// turns CONNECT into a byte tunnel or an intercepted TLS session.
pub struct ProxyHandler<T> {
    pub(crate) transport: Arc<T>,
    pub(crate) ca: Option<Arc<CaRoot>>,
    pub(crate) options: HandlerOptions,
}

impl<T> Clone for ProxyHandler<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            ca: self.ca.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T: RoundTrip> ProxyHandler<T> {
    pub fn new(transport: Arc<T>, options: HandlerOptions) -> Self {
        Self {
            transport,
            ca: None,
            options,
        }
    }

    /// Sets the CA used to forge leaf certificates. Without one, every
    /// intercepted CONNECT is dropped right after the tunnel response.
    pub fn with_ca(mut self, ca: Arc<CaRoot>) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub async fn handle<C: ClientConn>(
        &self,
        request: loxy_net::Request,
        client: &mut C,
    ) -> Result<(), ProxyError> {
        info!(
            method = %request.line.method,
            target = %request.line.target,
            "request received"
        );
        if request.line.method.eq_ignore_ascii_case("CONNECT") {
            self.tunnel(request, client).await
        } else {
            self.relay(request, client).await
        }
    }

    async fn relay<C: ClientConn>(
        &self,
        request: loxy_net::Request,
        client: &mut C,
    ) -> Result<(), ProxyError> {
        let version = request.line.version.clone();
        let upstream = match relay_request(request) {
            Ok(upstream) => upstream,
            Err(err) => {
                client.respond(Response::empty(400, "Bad Request")).await?;
                return Err(err);
            }
        };
        let uri = upstream.uri.clone();

        match self.transport.round_trip(upstream).await {
            Ok(mut response) => {
                prepare_for_client(&mut response, &version);
                info!(%uri, status = response.status, length = ?response.body.length(), "relayed");
                client.respond(response).await
            }
            Err(err) => {
                warn!(%uri, error = %err, "upstream request failed");
                client.respond(Response::empty(502, "Bad Gateway")).await
            }
        }
    }

    async fn tunnel<C: ClientConn>(
        &self,
        request: loxy_net::Request,
        client: &mut C,
    ) -> Result<(), ProxyError> {
        let target = request.line.target;
        let mut raw = client.takeover()?;
        raw.write_all(TUNNEL_ESTABLISHED).await?;
        raw.flush().await?;
        info!(%target, mitm = self.options.mitm, "tunnel accepted");

        if self.options.mitm {
            return mitm::intercept(self, raw, &target).await;
        }

        let (host, port) = normalize_target(&target, self.options.default_port)?;
        let upstream = timeout(
            self.options.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ProxyError::Timeout("connecting tunnel upstream"))??;
        let _ = upstream.set_nodelay(true);

        let stats = splice(raw, upstream, self.options.tunnel_linger).await;
        info!(
            %target,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "tunnel closed"
        );
        Ok(())
    }
}

/// Drops hop-by-hop headers from an upstream response. Clients older than
/// HTTP/1.1 cannot read chunked bodies, so those get the raw body and a
/// closed connection instead. Returns whether the connection must close.
pub(crate) fn prepare_for_client(response: &mut Response, version: &HttpVersion) -> bool {
    strip_hop_by_hop(&mut response.headers);
    if *version == HttpVersion::Http11 || !response.is_chunked() {
        return false;
    }
    response.headers.remove(TRANSFER_ENCODING);
    response
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));
    true
}

/// Builds the upstream request for a plain proxy request. Absolute-form
/// targets are used as is; origin-form targets are resolved against `Host`.
fn relay_request(request: loxy_net::Request) -> Result<Request, ProxyError> {
    let target = request.line.target.as_str();
    let uri = if target.starts_with('/') {
        let host = request
            .header("host")
            .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
        format!("http://{host}{target}")
    } else {
        target.to_string()
    };
    let uri: Uri = uri
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(target.to_string()))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    }

    build_upstream(&request, uri)
}

pub(crate) fn build_upstream(request: &loxy_net::Request, uri: Uri) -> Result<Request, ProxyError> {
    let method = Method::from_bytes(request.line.method.as_bytes())
        .map_err(|err| ProxyError::Parse(format!("method {:?}: {err}", request.line.method)))?;
    let mut headers = header_map(&request.headers)?;
    strip_hop_by_hop(&mut headers);
    if !headers.contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|err| ProxyError::Parse(err.to_string()))?;
            headers.insert(HOST, value);
        }
    }

    Ok(Request::builder(uri)
        .method(method)
        .headers(headers)
        .body(request.body.clone())
        .build())
}

fn header_map(headers: &[Header]) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| ProxyError::Parse(format!("header {:?}: {err}", header.name)))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|err| ProxyError::Parse(format!("header {:?}: {err}", header.name)))?;
        map.append(name, value);
    }
    Ok(map)
}
