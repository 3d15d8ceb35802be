use crate::capture::CaptureStore;
use crate::config::Config;
use std::sync::Arc;

pub mod metrics;

pub use metrics::{Metrics, RequestTimer};

/// Shared handles for the proxy listener, the API server and `main`.
pub struct AppState {
    pub config: Config,
    pub store: Arc<CaptureStore>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<Self>, tokio::sync::broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(16);

        let store = Arc::new(CaptureStore::with_subscriber_buffer(
            config.capture.max_records,
            config.capture.subscriber_buffer,
        ));

        let state = Arc::new(Self {
            config,
            store,
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");
        let _ = self.shutdown_tx.send(());
    }
}
