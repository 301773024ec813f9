//! Tracing subscriber setup for binaries and tests embedding the engine.
//!
//! The library only emits `tracing` events; it never installs a subscriber on
//! its own. Call [`init_tracing`] once at startup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;
use crate::{Error, Result};

/// Build the filter, letting `RUST_LOG` win over the configured directive.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.filter),
    }
    .map_err(|e| Error::Config(format!("invalid log filter: {e}")))
}

/// Install a global fmt subscriber.
///
/// # Errors
///
/// [`Error::Config`] if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let result = if config.json {
        fmt().json().with_env_filter(filter).finish().try_init()
    } else {
        fmt().with_env_filter(filter).finish().try_init()
    };
    result.map_err(|e| Error::Config(format!("failed to set global subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filter() {
        let config = LoggingConfig {
            filter: "acc_ratings=loudest".to_string(),
            json: false,
        };
        // RUST_LOG unset in the test environment is the common case; only
        // assert when it cannot mask the configured directive.
        if std::env::var(EnvFilter::DEFAULT_ENV).is_err() {
            assert!(matches!(build_filter(&config), Err(Error::Config(_))));
        }
    }

    #[test]
    fn second_init_fails() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(Error::Config(_))));
    }
}
