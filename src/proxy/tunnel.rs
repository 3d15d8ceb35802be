//! CONNECT tunnelling.
//!
//! A tunnel moves through Connecting (dial the target), Upgrading (claim the
//! client's raw connection), Established (relay bytes both ways) and Closed.
//! The proxy never looks inside the relayed bytes. One capture record is
//! appended per CONNECT request: when the tunnel closes, or at the step that
//! failed.

use super::dial::Dialer;
use super::{status_response, ConnectionInfo, ProxyBody};
use crate::capture::{request_header_multimap, CaptureRecord, CaptureStore};
use crate::error::TunnelError;
use crate::state::Metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::ext::ReasonPhrase;
use hyper::header::HOST;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

const DEFAULT_TUNNEL_PORT: u16 = 443;

pub struct TunnelEngine {
    store: Arc<CaptureStore>,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<Metrics>,
    connect_timeout: Duration,
}

impl TunnelEngine {
    pub fn new(
        store: Arc<CaptureStore>,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<Metrics>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dialer,
            metrics,
            connect_timeout,
        }
    }

    /// Handle a CONNECT request. On success the returned 200 acknowledges the
    /// tunnel; the relay runs on its own task once hyper hands over the raw
    /// connection.
    pub async fn connect<B>(&self, mut request: Request<B>, conn: &ConnectionInfo) -> Response<ProxyBody> {
        let start = Instant::now();
        self.metrics.record_tunnel();

        let authority = connect_authority(&request);
        let mut record = CaptureRecord::begin("CONNECT", conn.remote_addr.to_string());
        record.url = format!("https://{authority}");
        record.host = authority.clone();
        record.protocol = format!("{:?}", request.version());
        record.request_headers = request_header_multimap(request.headers());
        record.is_https = true;
        record.is_tunnel = true;

        if authority.is_empty() {
            record.status_code = StatusCode::BAD_REQUEST.as_u16();
            warn!("[CONNECT] request without a target");
            return self.reject(record, start, StatusCode::BAD_REQUEST);
        }

        // Connecting
        let target = dial_target(&authority);
        let upstream = match self.dialer.dial(&target, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, error = %e, "[CONNECT] failed to reach target");
                return self.reject(record, start, e.status_code());
            }
        };

        // Upgrading
        let on_upgrade = match take_raw_connection(&mut request) {
            Ok(on_upgrade) => on_upgrade,
            Err(e) => {
                warn!(target = %target, error = %e, "[CONNECT] cannot take over client connection");
                return self.reject(record, start, e.status_code());
            }
        };

        let store = self.store.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let client = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    let error = TunnelError::Upgrade(e.to_string());
                    warn!(target = %target, error = %error, "[CONNECT] connection takeover failed");
                    record.status_code = error.status_code().as_u16();
                    record.duration = start.elapsed();
                    store.append(record);
                    metrics.record_failed_tunnel();
                    return;
                }
            };

            // Established
            record.status_code = StatusCode::OK.as_u16();
            info!(target = %target, "[CONNECT] tunnel established");
            metrics.tunnel_opened();

            let outcome = relay(TokioIo::new(client), upstream).await;

            // Closed
            metrics.tunnel_closed();
            record.duration = start.elapsed();
            match &outcome.result {
                Ok(bytes) => debug!(
                    target = %target,
                    direction = ?outcome.finished,
                    bytes = bytes,
                    "[CONNECT] relay finished"
                ),
                Err(e) => debug!(
                    target = %target,
                    direction = ?outcome.finished,
                    error = %e,
                    "[CONNECT] relay ended with error"
                ),
            }
            info!(
                target = %target,
                duration_ms = record.duration_ms(),
                "[CONNECT] tunnel closed"
            );
            store.append(record);
        });

        established_response()
    }

    fn reject(&self, mut record: CaptureRecord, start: Instant, status: StatusCode) -> Response<ProxyBody> {
        record.status_code = status.as_u16();
        record.duration = start.elapsed();
        self.store.append(record);
        self.metrics.record_failed_tunnel();
        status_response(status)
    }
}

/// `host:port` named by a CONNECT request, from the request target or `Host`.
fn connect_authority<B>(request: &Request<B>) -> String {
    if let Some(authority) = request.uri().authority() {
        return authority.to_string();
    }
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Append the default TLS port when the authority carries none.
pub fn dial_target(authority: &str) -> String {
    let has_port = match authority.rsplit_once(':') {
        // Bracketed IPv6 literal: only a colon after `]` starts a port.
        Some((host, port)) if host.starts_with('[') => host.ends_with(']') && !port.is_empty(),
        Some((host, port)) => !host.contains(':') && !port.is_empty(),
        None => false,
    };

    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:{DEFAULT_TUNNEL_PORT}")
    }
}

fn take_raw_connection<B>(request: &mut Request<B>) -> Result<OnUpgrade, TunnelError> {
    request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(TunnelError::UpgradeUnsupported)
}

fn established_response() -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

/// How a relay ended: the direction that finished first and what it copied.
#[derive(Debug)]
pub struct RelayOutcome {
    pub finished: Direction,
    pub result: io::Result<u64>,
}

/// Copy bytes both ways until either direction ends, then tear down both.
///
/// A half-close from either side ends the whole tunnel. Both connections are
/// dropped before this returns.
pub async fn relay<C, T>(client: C, target: T) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let mut upstream =
        tokio::spawn(async move { tokio::io::copy(&mut client_read, &mut target_write).await });
    let mut downstream =
        tokio::spawn(async move { tokio::io::copy(&mut target_read, &mut client_write).await });

    let (finished, joined, other) = tokio::select! {
        joined = &mut upstream => (Direction::ClientToTarget, joined, downstream),
        joined = &mut downstream => (Direction::TargetToClient, joined, upstream),
    };

    other.abort();
    let _ = other.await;

    let result = joined.unwrap_or_else(|e| Err(io::Error::other(e)));
    RelayOutcome { finished, result }
}
