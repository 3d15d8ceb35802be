use hyper::StatusCode;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failures talking to the origin server on behalf of a forwarded request.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Invalid outbound request: {0}")]
    InvalidRequest(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Status reported to the client and stored in the capture record.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpstreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UpstreamError::Connect(_)
            | UpstreamError::Timeout(_)
            | UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Failures while establishing a CONNECT tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    DialTimeout(String),

    #[error("Connection does not support raw takeover")]
    UpgradeUnsupported,

    #[error("Connection takeover failed: {0}")]
    Upgrade(String),
}

impl TunnelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::Dial { .. } | TunnelError::DialTimeout(_) => StatusCode::BAD_GATEWAY,
            TunnelError::UpgradeUnsupported | TunnelError::Upgrade(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
