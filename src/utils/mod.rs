//! Shared utilities: logging setup, time, timeouts, shutdown signals

pub mod error;
pub mod logging;
pub mod signal;
pub mod time;
pub mod timeout;

// Re-export commonly used items
pub use error::log_error_async;
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config};
pub use signal::{create_shutdown_receiver, wait_for_shutdown_signal};
pub use time::{current_timestamp, current_timestamp_millis};
pub use timeout::{with_custom_timeout, with_millis_timeout};
