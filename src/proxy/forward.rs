//! Plain HTTP forwarding.
//!
//! Every non-CONNECT request goes through [`ForwardingEngine::forward`]: the
//! target URL is resolved, the request body is read up to the capture limit,
//! hop-by-hop headers are stripped, and the request is replayed against the
//! origin through an [`UpstreamClient`]. Exactly one capture record is
//! appended per request, including when the origin cannot be reached.

use super::headers::{forwardable_headers, remove_hop_by_hop_headers};
use super::upstream::UpstreamClient;
use super::{status_response, ConnectionInfo, ProxyBody};
use crate::capture::{
    captured_body, header_multimap, request_header_multimap, CaptureRecord, CaptureStore,
};
use crate::error::UpstreamError;
use crate::state::{Metrics, RequestTimer};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, Uri};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct ForwardingEngine {
    store: Arc<CaptureStore>,
    client: Arc<dyn UpstreamClient>,
    metrics: Arc<Metrics>,
    max_body_size: usize,
}

impl ForwardingEngine {
    pub fn new(
        store: Arc<CaptureStore>,
        client: Arc<dyn UpstreamClient>,
        metrics: Arc<Metrics>,
        max_body_size: usize,
    ) -> Self {
        Self {
            store,
            client,
            metrics,
            max_body_size,
        }
    }

    pub async fn forward<B>(&self, request: Request<B>, conn: &ConnectionInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let start = Instant::now();
        let timer = RequestTimer::new(self.metrics.clone());
        let (parts, body) = request.into_parts();

        let mut record = CaptureRecord::begin(parts.method.as_str(), conn.remote_addr.to_string());
        record.host = request_host(&parts);
        record.path = parts.uri.path().to_string();
        record.protocol = format!("{:?}", parts.version);
        record.is_https = conn.is_encrypted;
        record.request_headers = request_header_multimap(&parts.headers);

        let target = match target_uri(&parts, conn.is_encrypted) {
            Ok(uri) => uri,
            Err(e) => {
                record.url = parts.uri.to_string();
                return self.fail(record, start, timer, e);
            }
        };
        record.url = target.to_string();

        let body = read_body_capped(body, self.max_body_size).await;
        record.request_body = captured_body(body.clone());

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method.clone();
        *outbound.uri_mut() = target;
        *outbound.headers_mut() = forwardable_headers(&parts.headers);

        let upstream = match self.client.send(outbound, self.max_body_size).await {
            Ok(response) => response,
            Err(e) => return self.fail(record, start, timer, e),
        };

        let (upstream_parts, upstream_body) = upstream.into_parts();
        record.status_code = upstream_parts.status.as_u16();
        record.response_headers = header_multimap(&upstream_parts.headers);
        record.response_body = captured_body(upstream_body.clone());
        record.duration = start.elapsed();

        info!(
            method = %record.method,
            url = %record.url,
            status = record.status_code,
            duration_ms = record.duration_ms(),
            "[HTTP] request forwarded"
        );
        self.store.append(record);
        timer.finish();

        let mut headers = upstream_parts.headers;
        remove_hop_by_hop_headers(&mut headers);
        // A HEAD response has no body to measure, so the origin's length stands.
        if parts.method != Method::HEAD {
            headers.remove(CONTENT_LENGTH);
        }

        let mut response = Response::new(Full::new(upstream_body));
        *response.status_mut() = upstream_parts.status;
        *response.headers_mut() = headers;
        response
    }

    fn fail(
        &self,
        mut record: CaptureRecord,
        start: Instant,
        timer: RequestTimer,
        error: UpstreamError,
    ) -> Response<ProxyBody> {
        let status = error.status_code();
        record.status_code = status.as_u16();
        record.duration = start.elapsed();

        warn!(
            method = %record.method,
            url = %record.url,
            status = record.status_code,
            error = %error,
            "[HTTP] request failed"
        );
        self.store.append(record);
        timer.fail();

        status_response(status)
    }
}

/// The origin a request is aimed at. Absolute-form URIs are used verbatim;
/// origin-form requests are rebuilt from the `Host` header.
pub fn target_uri(parts: &Parts, encrypted: bool) -> Result<Uri, UpstreamError> {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return Ok(parts.uri.clone());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
        .ok_or_else(|| UpstreamError::InvalidRequest("request has no Host header".to_string()))?;

    let scheme = if encrypted { "https" } else { "http" };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme)
        .authority(host)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| UpstreamError::InvalidRequest(format!("invalid target {host}: {e}")))
}

fn request_host(parts: &Parts) -> String {
    parts
        .uri
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
        .unwrap_or_default()
}

/// Read at most `limit` bytes of `body`. The remainder is left unread and a
/// read error ends the body early with whatever arrived.
pub async fn read_body_capped<B>(mut body: B, limit: usize) -> Bytes
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    let take = data.len().min(limit - buf.len());
                    buf.extend_from_slice(&data[..take]);
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Error reading request body");
                break;
            }
            None => break,
        }
    }
    buf.freeze()
}
