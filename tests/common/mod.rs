#![allow(dead_code)]

use bytes::Bytes;
use capture_proxy::capture::CaptureStore;
use capture_proxy::config::Config;
use capture_proxy::proxy::{Dialer, ProxyServer, UpstreamClient};
use capture_proxy::state::AppState;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.proxy.listen_address = "127.0.0.1:0".to_string();
    config.api.listen_address = "127.0.0.1:0".to_string();
    config.proxy.connect_timeout_ms = 2_000;
    config.proxy.request_timeout_ms = 5_000;
    config
}

/// Proxy with the production upstream client and dialer.
pub async fn spawn_proxy(config: Config) -> (Arc<AppState>, SocketAddr) {
    let (state, _) = AppState::new(config);
    let server = ProxyServer::bind(state.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (state, addr)
}

pub async fn spawn_proxy_with(
    config: Config,
    client: Arc<dyn UpstreamClient>,
    dialer: Arc<dyn Dialer>,
) -> (Arc<AppState>, SocketAddr) {
    let (state, _) = AppState::new(config);
    let server = ProxyServer::bind_with(state.clone(), client, dialer)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (state, addr)
}

/// HTTP client that routes plain-HTTP requests through the proxy and never
/// follows redirects itself.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Local origin server.
///
/// - `/redirect` answers 302 with a `Location`.
/// - `/echo` answers JSON describing the request it received, plus a
///   `Proxy-Authenticate` header the proxy must not pass on.
/// - anything else answers `hello`.
pub async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_handler))
                    .await;
            });
        }
    });

    addr
}

async fn origin_handler(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match request.uri().path() {
        "/redirect" => Response::builder()
            .status(302)
            .header("location", "/elsewhere")
            .body(Full::new(Bytes::new()))
            .unwrap(),
        "/echo" => {
            let method = request.method().to_string();
            let headers: BTreeMap<String, String> = request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let body = request.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::json!({
                "method": method,
                "headers": headers,
                "body": String::from_utf8_lossy(&body),
            });
            Response::builder()
                .header("content-type", "application/json")
                .header("proxy-authenticate", "Basic realm=\"origin\"")
                .header("x-origin", "1")
                .body(Full::new(Bytes::from(json.to_string())))
                .unwrap()
        }
        _ => Response::new(Full::new(Bytes::from_static(b"hello"))),
    };
    Ok(response)
}

/// TCP server that echoes every byte back.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// A port nothing listens on.
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Read an HTTP response head byte by byte, leaving any body unread.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Wait until the store holds `count` records.
pub async fn wait_for_records(store: &CaptureStore, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} records, found {}", store.count()));
}
