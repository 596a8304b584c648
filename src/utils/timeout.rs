//! Timeout wrappers for outbound calls (decision service, event bus, fetches)

use std::time::Duration;
use tokio::time::{error::Elapsed, timeout};

/// Execute operation with custom timeout
pub async fn with_custom_timeout<F, T>(operation: F, duration: Duration) -> Result<T, Elapsed>
where
    F: std::future::Future<Output = T>,
{
    timeout(duration, operation).await
}

/// Execute operation with a timeout given in milliseconds, as configured
pub async fn with_millis_timeout<F, T>(operation: F, millis: u64) -> Result<T, Elapsed>
where
    F: std::future::Future<Output = T>,
{
    with_custom_timeout(operation, Duration::from_millis(millis)).await
}
