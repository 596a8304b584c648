//! Wall-clock helpers
//!
//! Never panic on clock skew: a clock before the epoch reads as zero.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using zero duration");
            Duration::from_secs(0)
        })
}

/// Current Unix timestamp (seconds since epoch)
pub fn current_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Current Unix timestamp in milliseconds, used for run record timestamps
pub fn current_timestamp_millis() -> u64 {
    since_epoch().as_millis() as u64
}
