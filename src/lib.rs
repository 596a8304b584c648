//! Void WASM executor
//!
//! Executes untrusted, content-addressed WebAssembly modules under
//! capability grants and resource budgets:
//!
//! 1. module bytes are resolved by SHA-256 and their signature verified
//! 2. policy decides admission, the resolved grant and the limits
//! 3. the module runs in an isolated wasm store; every side effect goes
//!    through the syscall gateway
//! 4. the run ledger records the lifecycle, usage and outcome
//!
//! Side effects (emitted events, outbound fetches, kv writes) are visible at
//! least once and are not rolled back when a run later fails.

// Memory allocator optimization using mimalloc
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod module;
pub mod rpc;
pub mod utils;

pub use config::ExecConfig;
pub use module::{ExecError, ExecutionManager, RunRequest, RunState, RunView, SubmitOutcome};
pub use rpc::ExecServer;
