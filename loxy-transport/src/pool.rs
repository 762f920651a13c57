use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::stream::UpstreamStream;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
struct IdleConnection {
    stream: UpstreamStream,
    idle_since: Instant,
}

/// Idle keep-alive connections, most recently returned first.
#[derive(Debug)]
pub struct Pool {
    max_idle_per_host: usize,
    idle_timeout: Duration,
    idle: Mutex<HashMap<PoolKey, Vec<IdleConnection>>>,
}

impl Pool {
    pub fn new(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            max_idle_per_host,
            idle_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub async fn checkout(&self, key: &PoolKey) -> Option<UpstreamStream> {
        let mut idle = self.idle.lock().await;
        self.prune(&mut idle);
        let connections = idle.get_mut(key)?;
        let stream = connections.pop().map(|conn| conn.stream);
        if connections.is_empty() {
            idle.remove(key);
        }
        stream
    }

    /// Returns a connection for reuse. Expired connections of every origin
    /// are closed on the way, so hosts that are never revisited do not keep
    /// sockets open.
    pub async fn checkin(&self, key: PoolKey, stream: UpstreamStream) {
        let mut idle = self.idle.lock().await;
        self.prune(&mut idle);
        if self.max_idle_per_host == 0 {
            return;
        }
        let connections = idle.entry(key).or_default();
        if connections.len() >= self.max_idle_per_host {
            connections.remove(0);
        }
        connections.push(IdleConnection {
            stream,
            idle_since: Instant::now(),
        });
    }

    fn prune(&self, idle: &mut HashMap<PoolKey, Vec<IdleConnection>>) {
        let now = Instant::now();
        idle.retain(|key, connections| {
            let before = connections.len();
            connections.retain(|conn| now.duration_since(conn.idle_since) < self.idle_timeout);
            if connections.len() < before {
                debug!(upstream = %key, closed = before - connections.len(), "closed expired idle connections");
            }
            !connections.is_empty()
        });
    }

    #[cfg(test)]
    pub async fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle.lock().await.get(key).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub async fn idle_hosts(&self) -> usize {
        self.idle.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::{Pool, PoolKey};
    use crate::stream::UpstreamStream;

    async fn connected_stream(listener: &TcpListener) -> UpstreamStream {
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        UpstreamStream::Plain(stream)
    }

    fn key() -> PoolKey {
        PoolKey {
            tls: false,
            host: "127.0.0.1".to_string(),
            port: 80,
        }
    }

    #[tokio::test]
    async fn keeps_at_most_max_idle_per_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = Pool::new(2, Duration::from_secs(60));
        for _ in 0..3 {
            pool.checkin(key(), connected_stream(&listener).await).await;
        }
        assert_eq!(pool.idle_count(&key()).await, 2);

        assert!(pool.checkout(&key()).await.is_some());
        assert_eq!(pool.idle_count(&key()).await, 1);
    }

    #[tokio::test]
    async fn expired_connections_are_not_handed_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = Pool::new(4, Duration::from_millis(10));
        pool.checkin(key(), connected_stream(&listener).await).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(pool.checkout(&key()).await.is_none());
        assert_eq!(pool.idle_count(&key()).await, 0);
    }

    #[tokio::test]
    async fn expired_connections_of_other_hosts_are_closed_on_checkin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = Pool::new(4, Duration::from_millis(10));
        let mut origin_sides = Vec::new();
        for port in 1..=50u16 {
            let host_key = PoolKey {
                tls: false,
                host: format!("host-{port}.test"),
                port,
            };
            pool.checkin(host_key, connected_stream(&listener).await).await;
            origin_sides.push(listener.accept().await.unwrap().0);
        }
        assert_eq!(pool.idle_hosts().await, 50);

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.checkin(key(), connected_stream(&listener).await).await;

        assert_eq!(pool.idle_hosts().await, 1);
        assert_eq!(pool.idle_count(&key()).await, 1);
        for mut origin in origin_sides {
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_secs(1), origin.read(&mut buf))
                .await
                .expect("origin saw no close");
            assert_eq!(read.unwrap(), 0);
        }
    }

    #[test]
    fn key_displays_as_origin() {
        let key = PoolKey {
            tls: true,
            host: "example.test".to_string(),
            port: 443,
        };
        assert_eq!(key.to_string(), "https://example.test:443");
    }
}
