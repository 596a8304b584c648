//! Syscall channel between a running module and the host
//!
//! The guest writes newline-delimited JSON requests into its linear memory
//! and receives one newline-delimited response per request.

pub mod protocol;

pub use protocol::{
    decode_batch, encode_batch, FetchLimits, HttpRequestSpec, ProtocolError, ResponseStatus,
    SyscallRequest, SyscallResponse, PROTOCOL_VERSION,
};
