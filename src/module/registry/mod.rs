//! Content-addressed module storage
//!
//! Resolves module bytes by SHA-256 from the local cache, in-memory
//! registrations, or the reference's source (file, HTTP(S), IPFS).

pub mod store;

pub use store::{ModuleArtifact, ModuleOrigin, ModuleStore, ModuleStoreError};
