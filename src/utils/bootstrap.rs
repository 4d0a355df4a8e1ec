//! Bootstrap utilities for the hypercards binary.
//!
//! Shared initialization code: tracing, connection retry, shutdown signals.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the HYPERCARDS_LOG environment variable.
///
/// Defaults to "info" level if HYPERCARDS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Bounded exponential backoff for initial connections.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Connect to a backing service with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "rabbitmq", "redis")
/// * `address` - The address to connect to, credentials redacted
/// * `policy` - Attempt budget and delays
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max attempts.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    policy: RetryPolicy,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(conn) => {
                info!(service = service_name, address, attempt, "Connected");
                return Ok(conn);
            }
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    "Failed to connect to {} (attempt {}/{}): {}. Retrying in {:?}...",
                    service_name, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
            Err(e) => {
                tracing::error!(
                    "Failed to connect to {} after {} attempts: {}",
                    service_name,
                    policy.max_attempts,
                    e
                );
                return Err(e);
            }
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_connect_with_retry_eventually_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<&str, String> =
            connect_with_retry("test", "localhost", fast_policy(5), || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("refused".to_string())
                    } else {
                        Ok("connected")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), String> =
            connect_with_retry("test", "localhost", fast_policy(3), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("refused".to_string())
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
