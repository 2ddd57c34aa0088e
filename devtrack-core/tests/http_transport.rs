//! Integration tests for the HTTP transport against a local listener

use devtrack_core::config::{CacheConfig, ServerConfig};
use devtrack_core::{
    ConnectionStatus, DeliveryClient, DeliveryOutcome, Device, HttpTransport, Payload,
    SendOutcome, Transport,
};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve exactly one request with `status`, returning the raw request text
async fn serve_once(status: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request_complete(&request) {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            status
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).into_owned()
    });

    (url, handle)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(split) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..split]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    request.len() >= split + 4 + content_length
}

fn payload() -> Payload {
    Payload::new(
        Device {
            vendor_id: 0x0781,
            product_id: 0x5581,
            serial_number: "4C530001".to_string(),
        },
        ConnectionStatus::Connected,
    )
}

#[tokio::test]
async fn test_success_status_is_delivered() {
    let (url, server) = serve_once("200 OK").await;
    let transport = HttpTransport::new(format!("{}/api/v1/usb-logs/", url), Duration::from_secs(5))
        .unwrap();

    let body = payload().to_body().unwrap();
    assert_eq!(transport.attempt(&body).await, DeliveryOutcome::Delivered);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /api/v1/usb-logs/ HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
    assert!(request.contains("\"serial_number\":\"4C530001\""));
}

#[tokio::test]
async fn test_created_status_is_delivered() {
    let (url, server) = serve_once("201 Created").await;
    let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();

    assert!(transport.attempt(b"{}").await.is_delivered());
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let (url, server) = serve_once("500 Internal Server Error").await;
    let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();

    match transport.attempt(b"{}").await {
        DeliveryOutcome::TransientFailure(reason) => assert!(reason.contains("500")),
        DeliveryOutcome::Delivered => panic!("500 must not count as delivered"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = HttpTransport::new(url, Duration::from_secs(2)).unwrap();
    assert!(!transport.attempt(b"{}").await.is_delivered());
}

#[tokio::test]
async fn test_client_from_server_config_queues_on_rejection() {
    let (url, server) = serve_once("503 Service Unavailable").await;
    let (host, port) = url.rsplit_once(':').unwrap();
    let server_config = ServerConfig {
        url: Some(host.to_string()),
        port: port.parse().unwrap(),
        endpoint: "/api/v1/usb-logs/".to_string(),
        timeout_secs: 5,
    };

    let dir = TempDir::new().unwrap();
    let cache = CacheConfig {
        directory: dir.path().join("queue"),
        max_entries: 5,
        max_retries: 3,
        retry_period_seconds: 1.0,
    };
    let transport = HttpTransport::from_config(&server_config).unwrap();
    let client = DeliveryClient::open(&cache, transport).await.unwrap();

    assert_eq!(
        client.send(&payload()).await.unwrap(),
        SendOutcome::Queued { evicted: false }
    );
    assert_eq!(client.pending().await, 1);
    server.await.unwrap();
}
