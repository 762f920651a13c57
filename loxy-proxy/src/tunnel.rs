use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Splits a CONNECT target into host and port, applying `default_port` when
/// the target has none. IPv6 literals may be bracketed.
pub fn normalize_target(target: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let invalid = || ProxyError::InvalidTarget(target.to_string());
    let target = target.trim();

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => None,
            tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host, port)
    } else if target.parse::<IpAddr>().is_ok() {
        (target, None)
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (target, None),
        }
    };

    if host.is_empty() || host.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Copies bytes both ways until both directions finish.
///
/// When one direction ends, the write side it fed is shut down so the peer
/// sees EOF, and the other direction gets `linger` to drain before both
/// streams are dropped. Byte counts include whatever a torn-down direction
/// relayed before it was dropped.
pub async fn splice<A, B>(client: A, upstream: B, linger: Duration) -> TunnelStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let outbound = async {
        let copied = copy_counted(&mut client_read, &mut upstream_write, &sent).await;
        let _ = upstream_write.shutdown().await;
        log_failure(copied, "client->upstream");
    };
    let inbound = async {
        let copied = copy_counted(&mut upstream_read, &mut client_write, &received).await;
        let _ = client_write.shutdown().await;
        log_failure(copied, "upstream->client");
    };
    tokio::pin!(outbound);
    tokio::pin!(inbound);

    tokio::select! {
        _ = &mut outbound => linger_on(&mut inbound, linger, "upstream->client").await,
        _ = &mut inbound => linger_on(&mut outbound, linger, "client->upstream").await,
    }

    TunnelStats {
        client_to_upstream: sent.load(Ordering::Relaxed),
        upstream_to_client: received.load(Ordering::Relaxed),
    }
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
        writer.flush().await?;
    }
}

async fn linger_on<F>(direction: F, linger: Duration, name: &'static str)
where
    F: std::future::Future<Output = ()>,
{
    if timeout(linger, direction).await.is_err() {
        debug!(direction = name, "tunnel direction still open after linger, closing");
    }
}

fn log_failure(copied: std::io::Result<()>, name: &'static str) {
    if let Err(err) = copied {
        debug!(direction = name, error = %err, "tunnel direction failed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{normalize_target, splice};
    use crate::error::ProxyError;

    #[test]
    fn target_without_port_gets_default() {
        assert_eq!(
            normalize_target("example.test", 443).unwrap(),
            ("example.test".to_string(), 443)
        );
        assert_eq!(
            normalize_target("example.test:8443", 443).unwrap(),
            ("example.test".to_string(), 8443)
        );
    }

    #[test]
    fn ipv6_targets() {
        assert_eq!(normalize_target("[::1]:9000", 443).unwrap(), ("::1".to_string(), 9000));
        assert_eq!(normalize_target("[::1]", 443).unwrap(), ("::1".to_string(), 443));
        assert_eq!(normalize_target("::1", 443).unwrap(), ("::1".to_string(), 443));
    }

    #[test]
    fn rejects_malformed_targets() {
        assert_matches!(normalize_target("", 443), Err(ProxyError::InvalidTarget(_)));
        assert_matches!(normalize_target("host:http", 443), Err(ProxyError::InvalidTarget(_)));
        assert_matches!(normalize_target("[::1", 443), Err(ProxyError::InvalidTarget(_)));
        assert_matches!(normalize_target("/path", 443), Err(ProxyError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn splice_relays_both_ways_and_propagates_close() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (upstream, mut upstream_peer) = tokio::io::duplex(64);

        let task = tokio::spawn(splice(client, upstream, Duration::from_secs(1)));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        client_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(upstream_peer);

        let stats = task.await.unwrap();
        assert_eq!(stats.client_to_upstream, 4);
        assert_eq!(stats.upstream_to_client, 5);

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn stalled_direction_is_torn_down_after_linger() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (upstream, mut upstream_peer) = tokio::io::duplex(64);

        let task = tokio::spawn(splice(client, upstream, Duration::from_millis(50)));

        upstream_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client_peer.shutdown().await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.client_to_upstream, 0);
        assert_eq!(stats.upstream_to_client, 5);

        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
