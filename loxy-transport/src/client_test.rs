use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use http::{Method, Uri};
use loxy_net::{Limits, ParseStatus, RequestParser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{Client, ClientConfig, Request, RoundTrip, TransportError};

/// Reads one request off `stream`; `None` once the peer closed.
async fn read_request(stream: &mut TcpStream, parser: &mut RequestParser) -> Option<loxy_net::Request> {
    let mut buf = [0u8; 1024];
    let mut status = parser.push(&[]);
    loop {
        match status {
            ParseStatus::Complete { message, .. } => return Some(message),
            ParseStatus::Error { .. } => return None,
            ParseStatus::NeedMore { .. } => {}
        }
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        status = parser.push(&buf[..n]);
    }
}

/// Answers every request on every connection with `response`, then applies
/// `close_after_each` to decide whether to hang up.
async fn start_test_server(
    response: &'static [u8],
    close_after_each: bool,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut parser = RequestParser::new();
                while read_request(&mut stream, &mut parser).await.is_some() {
                    if stream.write_all(response).await.is_err() || close_after_each {
                        break;
                    }
                }
            });
        }
    });

    (addr, accepted)
}

fn test_client() -> Client {
    Client::new(ClientConfig {
        request_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn request_returns_response() {
    let (addr, _) = start_test_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", false).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();
    let request = Request::builder(uri).build();

    let response = client.request(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.reason, "OK");
    assert_eq!(response.body.length(), Some(2));
    assert_eq!(response.body.collect().await.unwrap(), b"OK".to_vec());
}

#[tokio::test]
async fn reuses_keep_alive_connection() {
    let (addr, accepted) =
        start_test_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", false).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    for _ in 0..3 {
        let response = client
            .round_trip(Request::builder(uri.clone()).build())
            .await
            .unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"OK".to_vec());
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undrained_body_does_not_return_connection() {
    let (addr, accepted) =
        start_test_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", false).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    let first = client.request(Request::builder(uri.clone()).build()).await.unwrap();
    drop(first);
    let second = client.request(Request::builder(uri).build()).await.unwrap();
    assert_eq!(second.body.collect().await.unwrap(), b"OK".to_vec());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn redials_when_pooled_connection_was_closed() {
    let (addr, accepted) =
        start_test_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", true).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    let first = client.request(Request::builder(uri.clone()).build()).await.unwrap();
    first.body.collect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let response = client.request(Request::builder(uri).build()).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn post_is_sent_once_when_origin_drops_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let posts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&posts);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut parser = RequestParser::new();
                while let Some(request) = read_request(&mut stream, &mut parser).await {
                    if request.line.method == "POST" {
                        counter.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                    if stream.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();
    let warmup = client.request(Request::builder(uri.clone()).build()).await.unwrap();
    warmup.body.collect().await.unwrap();

    let post = Request::builder(uri)
        .method(Method::POST)
        .body(b"charge=1".to_vec())
        .build();
    let result = client.request(post).await;

    assert_matches!(result, Err(TransportError::Closed));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(posts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reads_close_delimited_body() {
    let (addr, _) = start_test_server(b"HTTP/1.0 200 OK\r\nServer: old\r\n\r\nuntil close", true).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    let response = client.request(Request::builder(uri).build()).await.unwrap();
    assert_eq!(response.body.length(), None);
    assert_eq!(response.headers.get("transfer-encoding").unwrap(), "chunked");
    assert_eq!(response.body.collect().await.unwrap(), b"until close".to_vec());
}

#[tokio::test]
async fn head_request_does_not_wait_for_body() {
    let (addr, _) =
        start_test_server(b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n", false).await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    let response = client
        .request(Request::builder(uri).method(Method::HEAD).build())
        .await
        .unwrap();
    assert_eq!(response.headers.get("content-length").unwrap(), "500");
    assert!(response.body.collect().await.unwrap().is_empty());
}

#[tokio::test]
async fn streams_body_beyond_buffer_limit() {
    const BODY_SIZE: usize = 4 * 1024 * 1024;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut parser = RequestParser::new();
        read_request(&mut stream, &mut parser).await.unwrap();
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {BODY_SIZE}\r\n\r\n");
        stream.write_all(head.as_bytes()).await.unwrap();
        let block: Vec<u8> = (0..64 * 1024u32).map(|value| (value % 251) as u8).collect();
        for _ in 0..BODY_SIZE / block.len() {
            stream.write_all(&block).await.unwrap();
        }
    });

    let client = Client::new(ClientConfig {
        request_timeout: Duration::from_secs(5),
        limits: Limits {
            max_header_bytes: 16 * 1024,
            max_body_bytes: 1024,
        },
        ..ClientConfig::default()
    })
    .unwrap();
    let uri: Uri = format!("http://{}/large", addr).parse().unwrap();
    let mut response = client.request(Request::builder(uri).build()).await.unwrap();
    assert_eq!(response.body.length(), Some(BODY_SIZE as u64));

    let mut total = 0;
    let mut largest_piece = 0;
    while let Some(chunk) = response.body.chunk().await.unwrap() {
        assert_eq!(chunk[0], (total % (64 * 1024) % 251) as u8);
        total += chunk.len();
        largest_piece = largest_piece.max(chunk.len());
    }
    assert_eq!(total, BODY_SIZE);
    assert!(largest_piece < BODY_SIZE);
}

#[tokio::test]
async fn slow_body_outlives_request_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut parser = RequestParser::new();
        read_request(&mut stream, &mut parser).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(b"4\r\ntick\r\n").await.unwrap();
        }
        stream.write_all(b"0\r\n\r\n").await.unwrap();
    });

    let client = Client::new(ClientConfig {
        request_timeout: Duration::from_millis(200),
        body_idle_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    })
    .unwrap();
    let uri: Uri = format!("http://{}/events", addr).parse().unwrap();
    let response = client.request(Request::builder(uri).build()).await.unwrap();

    assert_eq!(response.body.collect().await.unwrap(), b"tick".repeat(5));
}

#[tokio::test]
async fn stalled_body_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut parser = RequestParser::new();
        read_request(&mut stream, &mut parser).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = Client::new(ClientConfig {
        body_idle_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    })
    .unwrap();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();
    let mut response = client.request(Request::builder(uri).build()).await.unwrap();

    assert_eq!(response.body.chunk().await.unwrap(), Some(b"partial".to_vec()));
    assert_matches!(response.body.chunk().await, Err(TransportError::Timeout(_)));
}

#[tokio::test]
async fn chunked_body_returns_connection_once_drained() {
    let (addr, accepted) = start_test_server(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        false,
    )
    .await;
    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    for _ in 0..2 {
        let response = client.request(Request::builder(uri.clone()).build()).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"abc".to_vec());
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refused_connection_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = test_client();
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();
    let result = client.request(Request::builder(uri).build()).await;
    assert_matches!(result, Err(TransportError::Connect { .. }));
}

#[tokio::test]
async fn rejects_unknown_scheme() {
    let client = test_client();
    let uri: Uri = "ftp://example.com/file".parse().unwrap();
    let result = client.request(Request::builder(uri).build()).await;
    assert_matches!(result, Err(TransportError::InvalidRequest(_)));
}
