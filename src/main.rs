use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use capture_proxy::config::{self, Config};
use capture_proxy::error::Result;
use capture_proxy::logging;
use capture_proxy::proxy::ProxyServer;
use capture_proxy::state::AppState;
use capture_proxy::web;

#[derive(Parser, Debug)]
#[command(name = "capture-proxy")]
#[command(about = "An HTTP/HTTPS forwarding proxy that records every exchange", long_about = None)]
struct Args {
    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Proxy listen address, e.g. 127.0.0.1:8080 or :8080
    #[arg(long, value_name = "ADDR")]
    proxy: Option<String>,

    /// API listen address
    #[arg(long, value_name = "ADDR")]
    api: Option<String>,

    /// Maximum number of captured requests kept in memory
    #[arg(long, value_name = "N")]
    max_requests: Option<usize>,

    /// Maximum captured body size in bytes
    #[arg(long, value_name = "BYTES")]
    max_body_size: Option<usize>,

    /// Do not start the query API
    #[arg(long)]
    no_api: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(proxy) = &self.proxy {
            config.proxy.listen_address = config::normalize_listen_address(proxy);
        }
        if let Some(api) = &self.api {
            config.api.listen_address = config::normalize_listen_address(api);
        }
        if let Some(max_requests) = self.max_requests {
            config.capture.max_records = max_requests;
        }
        if let Some(max_body_size) = self.max_body_size {
            config.proxy.max_body_size = max_body_size;
        }
        if self.no_api {
            config.api.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.debug)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path).await.inspect_err(|e| {
                error!("Failed to load configuration from {}: {}", path.display(), e);
            })?
        }
        None => config::load_from_env_or_file().await.inspect_err(|e| {
            error!("Failed to load configuration: {}", e);
        })?,
    };

    args.apply_overrides(&mut config);
    config::validate(&config).inspect_err(|e| error!("Invalid configuration: {}", e))?;

    let (state, _shutdown_rx) = AppState::new(config);

    let proxy_server = ProxyServer::bind(state.clone())
        .await
        .inspect_err(|e| error!("Proxy server error: {}", e))?;
    let proxy_addr = proxy_server.local_addr()?;

    let api = if state.config.api.enabled {
        let (addr, server) =
            web::bind(state.clone()).inspect_err(|e| error!("API server error: {}", e))?;
        Some((addr, server))
    } else {
        None
    };

    print_banner(&state.config, proxy_addr, api.as_ref().map(|(addr, _)| *addr));

    let mut proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    let mut api_handle = api.map(|(_, server)| {
        tokio::spawn(async move {
            server.await;
            info!("API server stopped");
        })
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = &mut proxy_handle => {
            error!("Proxy server exited unexpectedly");
        }
        _ = async {
            match api_handle.as_mut() {
                Some(handle) => { let _ = handle.await; }
                None => std::future::pending::<()>().await,
            }
        } => {
            error!("API server exited unexpectedly");
        }
    }

    info!("Shutting down capture proxy");

    let shutdown_timeout = tokio::time::timeout(tokio::time::Duration::from_secs(10), async {
        state.shutdown();

        // A handle that already completed inside the select above must not be polled again.
        for handle in std::iter::once(proxy_handle).chain(api_handle) {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    })
    .await;

    match shutdown_timeout {
        Ok(_) => {
            info!(
                captured = state.store.count(),
                "Graceful shutdown completed"
            );
        }
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_banner(config: &Config, proxy_addr: std::net::SocketAddr, api_addr: Option<std::net::SocketAddr>) {
    info!("Capture proxy started");
    info!("  Proxy:      http://{}", proxy_addr);
    match api_addr {
        Some(addr) => {
            info!("  API:        http://{}/api/requests", addr);
            info!("  Live feed:  http://{}/api/requests/stream", addr);
        }
        None => info!("  API:        disabled"),
    }
    info!(
        "  Capturing up to {} requests, {} bytes per body",
        config.capture.max_records, config.proxy.max_body_size
    );
    info!("  Try: curl -x http://{} http://example.com", proxy_addr);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
