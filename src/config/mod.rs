pub mod loader;
pub mod schema;

pub use loader::{
    load_from_env_or_file, load_from_path, normalize, normalize_listen_address,
    resolve_listen_address, validate,
};
pub use schema::{ApiConfig, CaptureConfig, Config, ProxyConfig};
