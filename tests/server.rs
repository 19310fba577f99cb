use std::{net::SocketAddr, time::Duration};

use multipart_stress::{EventHarness, FormConfig, HarnessServer, ServerConfig};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

async fn start(idle: Duration) -> (HarnessServer, EventHarness, TempDir) {
    let uploads = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(FormConfig::new(uploads.path())).with_idle_timeout(idle);
    let (server, harness) = HarnessServer::bind(([127, 0, 0, 1], 0).into(), config)
        .await
        .unwrap();
    (server, harness, uploads)
}

fn head(addr: SocketAddr, content_type: Option<&str>, content_length: Option<usize>) -> String {
    let mut head = format!("POST /upload HTTP/1.1\r\nHost: {addr}\r\n");
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("\r\n");
    head
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn parses_fields_and_files() {
    let (server, mut harness, uploads) = start(Duration::from_secs(5)).await;
    let addr = server.local_addr();

    let body = "--xoxo\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\
        \r\n\
        hello\r\n\
        --xoxo\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        abc\r\n\
        --xoxo--\r\n";
    let request = head(
        addr,
        Some("multipart/form-data; boundary=xoxo"),
        Some(body.len()),
    ) + body;

    let response = exchange(addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

    let observed = harness.settle(Duration::from_secs(5)).await;
    assert_eq!(observed.fields_parsed, 1);
    assert_eq!(observed.files_parsed, 1);
    assert!(observed.ended);
    assert_eq!(server.requests_received(), 1);

    let stored: Vec<_> = std::fs::read_dir(uploads.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(std::fs::read(&stored[0]).unwrap(), b"abc");

    server.shutdown().await;
}

#[tokio::test]
async fn stalled_body_is_aborted_after_idle_timeout() {
    let (server, mut harness, _uploads) = start(Duration::from_millis(200)).await;
    let addr = server.local_addr();

    let partial = "--xoxo\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        \r\n\
        abc";
    let request = head(addr, Some("multipart/form-data; boundary=xoxo"), Some(1000)) + partial;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let observed = harness.settle(Duration::from_secs(5)).await;
    assert!(observed.got_aborted);
    assert!(!observed.ended);
    assert_eq!(observed.files_parsed, 0);
    assert_eq!(observed.terminal_events, 1);

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    drop(stream);
    server.shutdown().await;
}

#[tokio::test]
async fn rejects_non_multipart_request() {
    let (server, _harness, _uploads) = start(Duration::from_secs(5)).await;
    let addr = server.local_addr();

    let request = head(addr, Some("application/json"), Some(0));
    let response = exchange(addr, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert_eq!(server.requests_received(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn requires_content_length() {
    let (server, _harness, _uploads) = start(Duration::from_secs(5)).await;
    let addr = server.local_addr();

    let request = head(addr, Some("multipart/form-data; boundary=xoxo"), None);
    let response = exchange(addr, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 411 Length Required\r\n"), "{response}");

    server.shutdown().await;
}
