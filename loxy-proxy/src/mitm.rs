use std::pin::Pin;

use http::Uri;
use http::header::{CONNECTION, HeaderValue};
use loxy_net::{RequestParser, TlsError, TlsErrorKind, build_acceptor, forge_leaf};
use loxy_transport::RoundTrip;
use openssl::ssl::Ssl;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{info, warn};

use crate::conn::{read_request, write_response};
use crate::error::ProxyError;
use crate::handler::{ProxyHandler, build_upstream, prepare_for_client};

/// Terminates TLS on `raw` with a leaf forged for `target` and forwards each
/// decrypted request to the real origin, one at a time.
pub(crate) async fn intercept<T, S>(
    handler: &ProxyHandler<T>,
    raw: S,
    target: &str,
) -> Result<(), ProxyError>
where
    T: RoundTrip,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let options = &handler.options;
    let ca = handler.ca.as_deref().ok_or_else(|| {
        ProxyError::Config("interception is enabled but no CA is loaded".to_string())
    })?;

    let leaf = forge_leaf(ca, target)?;
    let acceptor = build_acceptor(&leaf)?;
    let ssl = Ssl::new(acceptor.context()).map_err(openssl_error)?;
    let mut stream = SslStream::new(ssl, raw).map_err(openssl_error)?;
    timeout(options.handshake_timeout, Pin::new(&mut stream).accept())
        .await
        .map_err(|_| ProxyError::Timeout("during client TLS handshake"))?
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, format!("handshake with client: {err}")))?;
    info!(host = %leaf.host, "intercepting");

    let mut parser = RequestParser::with_limits(options.limits);
    while let Some(request) = read_request(&mut stream, &mut parser, options.idle_timeout).await? {
        let mut close = request.wants_close();
        let uri = intercepted_uri(&request, target)?;
        let upstream = build_upstream(&request, uri.clone())?;

        let mut response = match handler.transport.round_trip(upstream).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%uri, error = %err, "intercepted request failed");
                return Err(err.into());
            }
        };
        close |= prepare_for_client(&mut response, &request.line.version);
        if close {
            response
                .headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        info!(
            method = %request.line.method,
            %uri,
            status = response.status,
            "intercepted request"
        );
        write_response(&mut stream, response, options.idle_timeout).await?;

        if close {
            break;
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// `https://<authority><path>`, with the authority from `Host` when present
/// and from the CONNECT target otherwise.
fn intercepted_uri(request: &loxy_net::Request, target: &str) -> Result<Uri, ProxyError> {
    let line_target = request.line.target.as_str();
    let absolute = line_target
        .parse::<Uri>()
        .ok()
        .filter(|uri| uri.authority().is_some());

    let authority = match request.header("host").filter(|host| !host.is_empty()) {
        Some(host) => host.to_string(),
        None => match absolute.as_ref().and_then(|uri| uri.authority()) {
            Some(authority) => authority.to_string(),
            None => target.to_string(),
        },
    };
    let path = match &absolute {
        Some(uri) => uri
            .path_and_query()
            .map(|value| value.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        None if line_target.starts_with('/') => line_target.to_string(),
        None => return Err(ProxyError::InvalidTarget(line_target.to_string())),
    };

    format!("https://{authority}{path}")
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(format!("{authority}{path}")))
}

fn openssl_error(err: openssl::error::ErrorStack) -> TlsError {
    TlsError::new(TlsErrorKind::OpenSsl, err.to_string())
}
