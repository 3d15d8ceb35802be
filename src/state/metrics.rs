use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Forwarded requests
    pub total_requests: IntCounter,
    pub failed_requests: IntCounter,
    pub request_duration: Histogram,

    // CONNECT tunnels
    pub total_tunnels: IntCounter,
    pub failed_tunnels: IntCounter,
    pub active_tunnels: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests = IntCounter::new(
            "capture_proxy_requests_total",
            "Total number of forwarded requests",
        )
        .expect("metric creation failed");
        let failed_requests = IntCounter::new(
            "capture_proxy_requests_failed",
            "Forwarded requests that did not reach the origin",
        )
        .expect("metric creation failed");
        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "capture_proxy_request_duration_seconds",
            "Forwarded request duration in seconds",
        ))
        .expect("metric creation failed");

        let total_tunnels = IntCounter::new(
            "capture_proxy_tunnels_total",
            "Total number of CONNECT requests",
        )
        .expect("metric creation failed");
        let failed_tunnels = IntCounter::new(
            "capture_proxy_tunnels_failed",
            "CONNECT requests that never established a tunnel",
        )
        .expect("metric creation failed");
        let active_tunnels = IntGauge::new(
            "capture_proxy_active_tunnels",
            "Number of currently open tunnels",
        )
        .expect("metric creation failed");

        for collector in [
            Box::new(total_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(failed_requests.clone()),
            Box::new(request_duration.clone()),
            Box::new(total_tunnels.clone()),
            Box::new(failed_tunnels.clone()),
            Box::new(active_tunnels.clone()),
        ] {
            registry.register(collector).expect("metric registration failed");
        }

        Self {
            registry,
            total_requests,
            failed_requests,
            request_duration,
            total_tunnels,
            failed_tunnels,
            active_tunnels,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.inc();
    }

    pub fn record_failed_request(&self) {
        self.failed_requests.inc();
    }

    pub fn record_request_duration(&self, duration: std::time::Duration) {
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_tunnel(&self) {
        self.total_tunnels.inc();
    }

    pub fn record_failed_tunnel(&self) {
        self.failed_tunnels.inc();
    }

    pub fn tunnel_opened(&self) {
        self.active_tunnels.inc();
    }

    pub fn tunnel_closed(&self) {
        self.active_tunnels.dec();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_request();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
    }

    pub fn fail(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
        self.metrics.record_failed_request();
    }
}
