//! Wasm sandbox: isolated stores with bounded memory, cpu and wall time

pub mod runtime;

pub use runtime::{ExecutionPlan, ExecutionReport, SandboxRuntime, SYSCALL_MODULE, SYSCALL_NAME};
