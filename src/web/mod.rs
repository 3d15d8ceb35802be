use crate::config::resolve_listen_address;
use crate::error::{ConfigError, ProxyError, Result};
use crate::state::AppState;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::Filter;

pub mod api;

/// Bind the API listener. The returned future serves until shutdown is
/// broadcast through the application state.
pub fn bind(state: Arc<AppState>) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let address = state.config.api.listen_address.clone();
    let addr = resolve_listen_address(&address).map_err(|e| {
        ProxyError::Config(ConfigError::Parse(format!(
            "Invalid API address {}: {}",
            address, e
        )))
    })?;

    let routes = create_routes(state.clone());
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.recv().await;
        })
        .map_err(|e| ProxyError::Bind {
            address,
            source: std::io::Error::other(e),
        })
}

pub fn create_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy"
        }))
    });

    api::routes(state).or(health).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
            .allow_headers(vec!["Content-Type"]),
    )
}
