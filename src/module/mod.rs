//! Execution of untrusted, content-addressed wasm modules
//!
//! ## Architecture
//!
//! - **registry**: resolves module bytes by SHA-256 (cache, file, HTTP, IPFS)
//! - **security**: signature verification, policy, canary routing
//! - **sandbox**: wasm stores with bounded memory, cpu and wall time
//! - **api** / **ipc**: the syscall gateway and its wire protocol
//! - **ledger**: run records and their lifecycle
//! - **manager**: drives a submission from admission to a terminal state

pub mod api;
pub mod ipc;
pub mod ledger;
pub mod manager;
pub mod registry;
pub mod sandbox;
pub mod security;
pub mod traits;

pub use ledger::{RunLedger, RunRecord, RunState, RunView};
pub use manager::{ExecutionManager, ManagerDeps, SubmitOutcome};
pub use sandbox::SandboxRuntime;
pub use security::{PolicyDecision, PolicyEngine, SignatureVerifier};
pub use traits::{
    EntrySignature, ErrorInfo, ExecError, ModuleReference, ResourceLimits, ResourceUsage,
    RunRequest, TypedValue, ValueType,
};
