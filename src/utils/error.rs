//! Error handling helpers for non-critical paths
//!
//! Lifecycle notification delivery and cache writes must never fail a run;
//! these helpers log the failure and carry on.

use tracing::warn;

/// Execute an async operation and log errors without failing
pub async fn log_error_async<F, Fut, T, E>(operation: F, context: &str) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match operation().await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}
