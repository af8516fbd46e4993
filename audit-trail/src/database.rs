//! PostgreSQL connection pool for the audit storage backend

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Create a connection pool, retrying with exponential backoff
///
/// Waits `retry_delay_secs * 2^(attempt-1)` between attempts and gives up
/// after `max_retries` retries.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let base_delay = Duration::from_secs(config.retry_delay_secs);
    let mut attempt = 0u32;

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                tracing::info!(
                    attempts = attempt + 1,
                    max_connections = config.max_connections,
                    min_connections = config.min_connections,
                    "Audit database pool created"
                );
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::error!(
                        attempts = attempt,
                        url = %sanitize_connection_url(&config.url),
                        error = %e,
                        "Giving up connecting to the audit database"
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.saturating_pow(attempt - 1);
                tracing::warn!(
                    attempt,
                    error = %e,
                    "Audit database connection failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            Error::TransientStorage(format!(
                "failed to connect to {}: {}",
                sanitize_connection_url(&config.url),
                e
            ))
        })
}

/// Hide the password in a connection URL
fn sanitize_connection_url(url: &str) -> String {
    let (Some(scheme_end), Some(at)) = (url.find("://"), url.rfind('@')) else {
        return url.to_string();
    };
    if at < scheme_end + 3 {
        return url.to_string();
    }
    let credentials = &url[scheme_end + 3..at];
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_connection_url() {
        assert_eq!(
            sanitize_connection_url("postgres://audit:s3cret@db:5432/beneficios"),
            "postgres://audit:***@db:5432/beneficios"
        );
        assert_eq!(
            sanitize_connection_url("postgres://db:5432/beneficios"),
            "postgres://db:5432/beneficios"
        );
    }
}
