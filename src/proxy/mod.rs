use crate::error::{ProxyError, Result};
use crate::state::AppState;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

pub mod dial;
pub mod forward;
pub mod headers;
pub mod tunnel;
pub mod upstream;

pub use dial::{Dialer, TcpDialer};
pub use forward::ForwardingEngine;
pub use tunnel::TunnelEngine;
pub use upstream::{HttpUpstream, UpstreamClient};

pub type ProxyBody = Full<Bytes>;

/// Facts about the client connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    /// The client connection itself is TLS. Origin-form targets then use https.
    pub is_encrypted: bool,
}

/// Routes each request to the forwarding or the tunnel engine.
#[derive(Clone)]
pub struct ProxyHandler {
    forward: Arc<ForwardingEngine>,
    tunnel: Arc<TunnelEngine>,
}

impl ProxyHandler {
    pub fn new(state: &AppState, client: Arc<dyn UpstreamClient>, dialer: Arc<dyn Dialer>) -> Self {
        let config = &state.config.proxy;
        let forward = ForwardingEngine::new(
            state.store.clone(),
            client,
            state.metrics.clone(),
            config.max_body_size,
        );
        let tunnel = TunnelEngine::new(
            state.store.clone(),
            dialer,
            state.metrics.clone(),
            config.connect_timeout(),
        );

        Self {
            forward: Arc::new(forward),
            tunnel: Arc::new(tunnel),
        }
    }

    pub async fn handle<B>(&self, request: Request<B>, conn: ConnectionInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        if request.method() == Method::CONNECT {
            self.tunnel.connect(request, &conn).await
        } else {
            self.forward.forward(request, &conn).await
        }
    }

    /// Serve HTTP/1.1 on one client connection until it closes, or until
    /// shutdown is signalled and in-flight requests have been answered.
    pub async fn serve_connection<I>(
        &self,
        io: I,
        conn: ConnectionInfo,
        header_read_timeout: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handler = self.clone();
        let service = service_fn(move |request: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(request, conn).await) }
        });

        let connection = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = shutdown.recv() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };

        if let Err(e) = result {
            tracing::debug!(client = %conn.remote_addr, error = %e, "Client connection ended with error");
        }
    }
}

pub struct ProxyServer {
    state: Arc<AppState>,
    handler: ProxyHandler,
    listener: TcpListener,
    shutdown_rx: tokio::sync::broadcast::Receiver<()>,
}

impl ProxyServer {
    /// Bind the proxy listener with the production upstream client and dialer.
    pub async fn bind(state: Arc<AppState>) -> Result<Self> {
        let client = HttpUpstream::new(&state.config.proxy)?;
        Self::bind_with(state, Arc::new(client), Arc::new(TcpDialer)).await
    }

    pub async fn bind_with(
        state: Arc<AppState>,
        client: Arc<dyn UpstreamClient>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let address = state.config.proxy.listen_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ProxyError::Bind {
                address: address.clone(),
                source,
            })?;
        let handler = ProxyHandler::new(&state, client, dialer);
        let shutdown_rx = state.shutdown_tx.subscribe();

        Ok(Self {
            state,
            handler,
            listener,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Proxy server listening on {}", self.local_addr()?);

        let header_read_timeout = self.state.config.proxy.header_read_timeout();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let conn = ConnectionInfo {
                        remote_addr,
                        is_encrypted: false,
                    };
                    let handler = self.handler.clone();
                    let connection_shutdown = self.state.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        handler
                            .serve_connection(stream, conn, header_read_timeout, connection_shutdown)
                            .await;
                    });
                }
                _ = self.shutdown_rx.recv() => break,
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Plain-text error response carrying the status's reason phrase.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(Full::new(Bytes::from(format!("{reason}\n"))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
