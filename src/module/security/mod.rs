//! Admission-time security: provenance, capabilities, policy and canary routing

pub mod canary;
pub mod decision;
pub mod permissions;
pub mod policy;
pub mod signature;

pub use canary::{CanaryController, Variant};
pub use decision::{DecisionClient, DecisionError, DecisionInput, HttpDecisionClient};
pub use permissions::{host_allowed, parse_capability_string, CapabilityGrant, CapabilityKind, HttpGrant};
pub use policy::{module_allowed, PolicyDecision, PolicyEngine};
pub use signature::{
    module_digest, sign_module, SignatureMaterial, SignatureVerifier, VerifyError, VerifyOutcome,
};
