//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON tracing output filtered by `service.log_level`
///
/// Falls back to `info` when the configured level is not a valid filter
/// directive. Calling this twice is an error because the global subscriber can
/// only be set once.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| crate::error::Error::Internal(format!("tracing already initialized: {}", e)))?;

    tracing::info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Tracing initialized"
    );

    Ok(())
}
