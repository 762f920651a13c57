use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use loxy_net::{ParseStatus, RequestParser};
use loxy_transport::Response;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

/// The client side of one inbound request, as handed to the handler by the
/// serving layer.
pub trait ClientConn: Send {
    /// The raw duplex stream obtained by taking over the connection.
    type Raw: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Writes an HTTP response to the client, streaming its body.
    fn respond(&mut self, response: Response) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Takes exclusive ownership of the underlying connection. After this the
    /// serving layer must not touch the connection again.
    ///
    /// Fails with [`ProxyError::HijackUnsupported`] when the connection cannot
    /// be handed over.
    fn takeover(&mut self) -> Result<Self::Raw, ProxyError>;
}

/// A stream that first replays bytes already read off `inner`.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Vec<u8>,
    position: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            position: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position < this.prefix.len() {
            let remaining = &this.prefix[this.position..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.position += n;
            if this.position == this.prefix.len() {
                this.prefix = Vec::new();
                this.position = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reads the next request off `stream`.
///
/// Returns `Ok(None)` when the peer closes, or stays silent for `idle`,
/// between requests. The same events in the middle of a request are errors.
pub async fn read_request<S>(
    stream: &mut S,
    parser: &mut RequestParser,
    idle: Duration,
) -> Result<Option<loxy_net::Request>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; 8192];
    let mut status = parser.push(&[]);
    loop {
        match status {
            ParseStatus::Complete { message, .. } => return Ok(Some(message)),
            ParseStatus::Error { error, .. } => return Err(ProxyError::Parse(error.to_string())),
            ParseStatus::NeedMore { .. } => {}
        }

        let n = match timeout(idle, stream.read(&mut buffer)).await {
            Ok(read) => read?,
            Err(_) if parser.is_empty() => {
                debug!("connection idle, closing");
                return Ok(None);
            }
            Err(_) => return Err(ProxyError::Timeout("reading request")),
        };
        if n == 0 {
            if parser.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Parse("connection closed mid-request".to_string()));
        }
        status = parser.push(&buffer[..n]);
    }
}

/// Writes `response` to `stream` as its body arrives.
///
/// Bodies labelled `Transfer-Encoding: chunked` are framed as chunks, all
/// others go out as they are. Every write has to finish within `idle`.
pub async fn write_response<S>(
    stream: &mut S,
    mut response: Response,
    idle: Duration,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin + Send,
{
    let chunked = response.is_chunked();
    write_within(stream, &response.encode_head(), idle).await?;

    let mut frame = Vec::new();
    while let Some(data) = response.body.chunk().await? {
        if chunked {
            frame.clear();
            frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            frame.extend_from_slice(&data);
            frame.extend_from_slice(b"\r\n");
            write_within(stream, &frame, idle).await?;
        } else {
            write_within(stream, &data, idle).await?;
        }
    }
    if chunked {
        write_within(stream, b"0\r\n\r\n", idle).await?;
    }
    timeout(idle, stream.flush())
        .await
        .map_err(|_| ProxyError::Timeout("writing response"))??;
    Ok(())
}

async fn write_within<S>(stream: &mut S, bytes: &[u8], idle: Duration) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    timeout(idle, stream.write_all(bytes))
        .await
        .map_err(|_| ProxyError::Timeout("writing response"))??;
    Ok(())
}
