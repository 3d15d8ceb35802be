use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_listen_address")]
    pub listen_address: String,
    /// Time allowed for a client to send the request head.
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_ms: u64,
    /// Per-call timeout for forwarded requests, body included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Dial timeout for CONNECT targets.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Cap applied independently to captured request and response bodies.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen_address")]
    pub listen_address: String,
}

fn default_proxy_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_header_read_timeout() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_records() -> usize {
    crate::capture::store::DEFAULT_CAPACITY
}

fn default_subscriber_buffer() -> usize {
    crate::capture::store::DEFAULT_SUBSCRIBER_BUFFER
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen_address() -> String {
    "0.0.0.0:8081".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_proxy_listen_address(),
            header_read_timeout_ms: default_header_read_timeout(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_body_size: default_max_body_size(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen_address: default_api_listen_address(),
        }
    }
}

impl ProxyConfig {
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_millis(self.header_read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}
