mod common;

use async_trait::async_trait;
use capture_proxy::error::TunnelError;
use capture_proxy::proxy::dial::BoxedStream;
use capture_proxy::proxy::{Dialer, HttpUpstream};
use common::*;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn open_tunnel(proxy: std::net::SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}

#[tokio::test]
async fn test_tunnel_relays_bytes_and_records_on_close() {
    let echo = spawn_echo().await;
    let (state, proxy) = spawn_proxy(test_config()).await;

    let (mut stream, head) = open_tunnel(proxy, &echo.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"), "{head}");

    // Nothing is recorded while the tunnel is open.
    assert_eq!(state.store.count(), 0);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(stream);
    wait_for_records(&state.store, 1).await;

    let records = state.store.all();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.method, "CONNECT");
    assert_eq!(record.host, echo.to_string());
    assert_eq!(record.url, format!("https://{echo}"));
    assert_eq!(record.path, "");
    assert_eq!(record.status_code, 200);
    assert!(record.is_tunnel);
    assert!(record.is_https);
    assert_eq!(record.request_body, None);
    assert_eq!(record.response_body, None);
}

#[tokio::test]
async fn test_unreachable_target_is_bad_gateway() {
    let target = closed_port();
    let (state, proxy) = spawn_proxy(test_config()).await;

    let (_stream, head) = open_tunnel(proxy, &target.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");

    let records = state.store.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].method, "CONNECT");
    assert_eq!(records[0].status_code, 502);
    assert!(records[0].is_tunnel);
}

/// Dialer that hands out in-memory echo connections and remembers targets.
#[derive(Default)]
struct EchoDialer {
    targets: Mutex<Vec<String>>,
}

#[async_trait]
impl Dialer for EchoDialer {
    async fn dial(&self, target: &str, _timeout: Duration) -> Result<BoxedStream, TunnelError> {
        self.targets.lock().unwrap().push(target.to_string());
        let (near, far) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }
}

#[tokio::test]
async fn test_tunnel_to_named_host() {
    let config = test_config();
    let dialer = Arc::new(EchoDialer::default());
    let upstream = Arc::new(HttpUpstream::new(&config.proxy).unwrap());
    let (state, proxy) = spawn_proxy_with(config, upstream, dialer.clone()).await;

    let (mut stream, head) = open_tunnel(proxy, "example.test:443").await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    stream.write_all(b"opaque tls bytes").await.unwrap();
    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"opaque tls bytes");

    drop(stream);
    wait_for_records(&state.store, 1).await;

    assert_eq!(
        dialer.targets.lock().unwrap().clone(),
        vec!["example.test:443".to_string()]
    );
    let record = &state.store.all()[0];
    assert_eq!(record.method, "CONNECT");
    assert_eq!(record.host, "example.test:443");
    assert_eq!(record.url, "https://example.test:443");
    assert_eq!(record.status_code, 200);
}
