//! Outbound HTTP client used by the forwarding engine.
//!
//! The engine talks to origins through the [`UpstreamClient`] trait so the
//! client can be swapped in tests. [`HttpUpstream`] is the production client:
//! it never follows redirects, keeps a bounded idle pool and applies a
//! per-call timeout.

use crate::config::ProxyConfig;
use crate::error::UpstreamError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::{Request, Response};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Send `request` to the origin named by its absolute URI. The response
    /// body is read up to `body_limit` bytes; anything beyond is discarded.
    async fn send(
        &self,
        request: Request<Bytes>,
        body_limit: usize,
    ) -> Result<Response<Bytes>, UpstreamError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(config: &ProxyConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .timeout(config.request_timeout())
            // Environment proxy settings would route our own traffic back through us.
            .no_proxy()
            .build()
            .map_err(|e| UpstreamError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn send(
        &self,
        request: Request<Bytes>,
        body_limit: usize,
    ) -> Result<Response<Bytes>, UpstreamError> {
        let (parts, body) = request.into_parts();

        let mut response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let version = response.version();
        let headers = std::mem::take(response.headers_mut());

        let mut body = BytesMut::new();
        while body.len() < body_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = chunk.len().min(body_limit - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Error reading upstream response body");
                    break;
                }
            }
        }

        let mut upstream = Response::new(body.freeze());
        *upstream.status_mut() = status;
        *upstream.version_mut() = version;
        *upstream.headers_mut() = headers;
        Ok(upstream)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> UpstreamError {
    let message = error_chain(&e);

    if e.is_builder() {
        UpstreamError::InvalidRequest(message)
    } else if e.is_timeout() {
        UpstreamError::Timeout(message)
    } else if e.is_connect() {
        UpstreamError::Connect(message)
    } else {
        UpstreamError::Transport(message)
    }
}

/// reqwest keeps the useful detail (DNS failure, refused, ...) in the source chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
