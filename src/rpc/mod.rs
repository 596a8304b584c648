//! HTTP API for the executor
//!
//! A thin hyper layer over [`ExecutionManager`](crate::module::manager::ExecutionManager):
//! request decoding, routing and status mapping live here, everything else
//! in the manager.

pub mod errors;
pub mod server;

pub use errors::{ApiError, ApiErrorCode};
pub use server::{parse_run_request, ExecServer, IDEMPOTENCY_HEADER, MAX_BODY_BYTES};
