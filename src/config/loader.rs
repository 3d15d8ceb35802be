use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

const ENV_PREFIX: &str = "CAPTURE_PROXY_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let mut config: Config = Figment::new()
        .merge(Toml::file("capture-proxy.toml"))
        .merge(Json::file("capture-proxy.json"))
        .merge(Yaml::file("capture-proxy.yaml"))
        .merge(Yaml::file("capture-proxy.yml"))
        // CAPTURE_PROXY_PROXY__LISTEN_ADDRESS -> proxy.listen_address
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    normalize(&mut config);
    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let mut config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    normalize(&mut config);
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let proxy_addr = parse_address("proxy.listen_address", &config.proxy.listen_address)?;

    if config.api.enabled {
        let api_addr = parse_address("api.listen_address", &config.api.listen_address)?;
        // Port 0 asks the OS for a fresh port, so two such listeners never collide.
        if api_addr == proxy_addr && proxy_addr.port() != 0 {
            return Err(ConfigError::Validation(
                "Proxy and API listen addresses must be different".into(),
            )
            .into());
        }
    }

    if config.proxy.max_body_size == 0 {
        return Err(
            ConfigError::Validation("proxy.max_body_size must be greater than 0".into()).into(),
        );
    }

    if config.proxy.request_timeout_ms == 0
        || config.proxy.connect_timeout_ms == 0
        || config.proxy.header_read_timeout_ms == 0
    {
        return Err(ConfigError::Validation("Proxy timeouts must be greater than 0".into()).into());
    }

    if config.capture.subscriber_buffer == 0 {
        return Err(ConfigError::Validation(
            "capture.subscriber_buffer must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

/// `:8080` -> `0.0.0.0:8080`; anything else is returned unchanged.
pub fn normalize_listen_address(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    }
}

pub fn normalize(config: &mut Config) {
    config.proxy.listen_address = normalize_listen_address(&config.proxy.listen_address);
    config.api.listen_address = normalize_listen_address(&config.api.listen_address);
}

/// Resolve a `host:port` listen address. IP literals are taken as-is; host
/// names go through the system resolver and the first result is used.
pub fn resolve_listen_address(value: &str) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", value),
        )
    })
}

fn parse_address(field: &str, value: &str) -> Result<SocketAddr> {
    resolve_listen_address(value).map_err(|e| {
        ConfigError::Validation(format!("{} '{}' is not a valid address: {}", field, value, e))
            .into()
    })
}
