//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AlertrError, AlertrResult};

/// Builds the filter: `RUST_LOG` wins over the configured directives.
fn env_filter(config: &LoggingConfig) -> AlertrResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| AlertrError::internal(format!("invalid log filter '{}': {e}", config.filter))),
    }
}

/// Installs the global subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> AlertrResult<()> {
    let filter = env_filter(config)?;
    let json = config.json.then(|| fmt::layer().json().with_target(true));
    let plain = (!config.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| AlertrError::internal(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "alertr=loud".to_string(),
            json: false,
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        env_filter(&LoggingConfig::default()).unwrap();
    }
}
