use crate::error::{ConfigError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` is honoured; the crate's own
/// level is `info`, or `debug` when requested.
pub fn init(debug: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        default_directive(debug)
            .parse()
            .map_err(|e| ConfigError::Parse(format!("Invalid log directive: {e}")))?,
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| ConfigError::Validation(format!("Logging already initialized: {e}")))?;

    Ok(())
}

fn default_directive(debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!("capture_proxy={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "capture_proxy=info");
        assert_eq!(default_directive(true), "capture_proxy=debug");
        assert!(default_directive(true)
            .parse::<tracing_subscriber::filter::Directive>()
            .is_ok());
    }
}
