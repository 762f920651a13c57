use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use http::header::CONNECTION;
use loxy_net::RequestParser;
use loxy_transport::{Response, RoundTrip};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::conn::{ClientConn, Rewind, read_request, write_response};
use crate::error::ProxyError;
use crate::handler::ProxyHandler;

/// Accepts proxy clients and feeds their requests to a [`ProxyHandler`].
pub struct ProxyServer<T> {
    listener: TcpListener,
    handler: ProxyHandler<T>,
}

impl<T: RoundTrip> ProxyServer<T> {
    pub async fn bind(addr: &str, handler: ProxyHandler<T>) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProxyError::Config(format!("bind {addr}: {err}")))?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!(addr = %self.local_addr()?, "proxy listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let handler = self.handler.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = serve_connection(handler, stream).await {
                        warn!(error = %err, "connection ended with error");
                    }
                }
                .instrument(info_span!("conn", %peer)),
            );
        }
    }
}

async fn serve_connection<T: RoundTrip>(
    handler: ProxyHandler<T>,
    stream: TcpStream,
) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);
    let options = handler.options().clone();
    let mut conn = ServerConn {
        stream: Some(stream),
        parser: RequestParser::with_limits(options.limits),
        write_timeout: options.idle_timeout,
        closing: false,
    };

    loop {
        let Some(stream) = conn.stream.as_mut() else {
            return Ok(());
        };
        let Some(request) = read_request(stream, &mut conn.parser, options.idle_timeout).await?
        else {
            debug!("client closed connection");
            return Ok(());
        };
        let close = request.wants_close();

        handler.handle(request, &mut conn).await?;

        if close || conn.closing {
            if let Some(stream) = conn.stream.as_mut() {
                let _ = stream.shutdown().await;
            }
            return Ok(());
        }
    }
}

/// A plain TCP client connection that can be taken over once.
pub struct ServerConn {
    stream: Option<TcpStream>,
    parser: RequestParser,
    write_timeout: Duration,
    closing: bool,
}

impl ClientConn for ServerConn {
    type Raw = Rewind<TcpStream>;

    fn respond(&mut self, response: Response) -> impl Future<Output = Result<(), ProxyError>> + Send {
        let write_timeout = self.write_timeout;
        async move {
            let close = closes_connection(&response);
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
            write_response(stream, response, write_timeout).await?;
            self.closing |= close;
            Ok(())
        }
    }

    fn takeover(&mut self) -> Result<Self::Raw, ProxyError> {
        let stream = self.stream.take().ok_or(ProxyError::HijackUnsupported)?;
        Ok(Rewind::new(self.parser.take_buffered(), stream))
    }
}

fn closes_connection(response: &Response) -> bool {
    response
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
