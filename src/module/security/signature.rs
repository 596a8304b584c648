//! Module provenance verification
//!
//! A module is verified in two steps: its SHA-256 must equal the content
//! address it was requested by, and (when present or required) a secp256k1
//! ECDSA signature over that digest must check against a trusted key.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey, VerifyOnly};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SignatureConfig;
use crate::module::traits::ModuleReference;

/// Hex SHA-256 of module bytes
pub fn module_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Sign module bytes, returning the compact signature as hex.
///
/// Used by publishing tools; the executor itself only verifies.
pub fn sign_module(bytes: &[u8], secret_key: &SecretKey) -> Result<String, secp256k1::Error> {
    let secp = Secp256k1::signing_only();
    let digest = Sha256::digest(bytes);
    let message = Message::from_digest_slice(digest.as_slice())?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(hex::encode(signature.serialize_compact()))
}

/// Signature and key as found next to a module or inline in its reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMaterial {
    /// Compact signature, hex
    pub signature: String,
    /// Compressed public key, hex
    pub public_key: String,
    /// Where the material came from (for logs)
    pub origin: String,
}

impl SignatureMaterial {
    pub fn new(signature: impl Into<String>, public_key: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            public_key: public_key.into(),
            origin: origin.into(),
        }
    }

    /// Inline material from a module reference, if both halves are present
    pub fn from_reference(reference: &ModuleReference) -> Option<Self> {
        match (&reference.signature, &reference.public_key) {
            (Some(sig), Some(key)) => Some(Self::new(sig.trim(), key.trim(), "inline")),
            _ => None,
        }
    }
}

/// Verification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Digest matched and the signature checked against `signer`
    Verified { signer: String },
    /// Digest matched; no signature was supplied and none is required
    Unsigned,
}

impl VerifyOutcome {
    pub fn signer(&self) -> Option<&str> {
        match self {
            VerifyOutcome::Verified { signer } => Some(signer),
            VerifyOutcome::Unsigned => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("module reference has an invalid sha256")]
    InvalidDigest,
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("signature required but none was supplied")]
    SignatureMissing,
    #[error("malformed signature material: {0}")]
    Malformed(String),
    #[error("signer key is not trusted")]
    UntrustedSigner,
    #[error("signature does not match module digest")]
    BadSignature,
}

impl VerifyError {
    /// Short reason recorded on denied runs
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::InvalidDigest => "invalid_digest",
            VerifyError::DigestMismatch { .. } => "digest_mismatch",
            VerifyError::SignatureMissing => "signature_missing",
            VerifyError::Malformed(_) => "malformed_signature",
            VerifyError::UntrustedSigner => "untrusted_signer",
            VerifyError::BadSignature => "bad_signature",
        }
    }
}

/// Checks module digests and signatures against the configured signer policy
pub struct SignatureVerifier {
    required: bool,
    /// Compressed key hex -> signer identity
    trusted: HashMap<String, String>,
    secp: Secp256k1<VerifyOnly>,
}

impl SignatureVerifier {
    pub fn new(config: &SignatureConfig) -> Self {
        let trusted = config
            .trusted_signers
            .iter()
            .map(|(identity, key)| (key.trim().to_ascii_lowercase(), identity.clone()))
            .collect();
        Self {
            required: config.required,
            trusted,
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Verify `bytes` against `reference`.
    ///
    /// Inline material on the reference wins over `sidecar`. Fails closed when
    /// a signature is required and neither is available.
    pub fn verify(
        &self,
        bytes: &[u8],
        reference: &ModuleReference,
        sidecar: Option<&SignatureMaterial>,
    ) -> Result<VerifyOutcome, VerifyError> {
        if !reference.has_valid_digest() {
            return Err(VerifyError::InvalidDigest);
        }
        let actual = module_digest(bytes);
        if actual != reference.sha256 {
            warn!(
                "Module digest mismatch: expected {}, got {}",
                reference.sha256, actual
            );
            return Err(VerifyError::DigestMismatch {
                expected: reference.sha256.clone(),
                actual,
            });
        }

        let inline = SignatureMaterial::from_reference(reference);
        let material = match inline.as_ref().or(sidecar) {
            Some(material) => material,
            None if self.required => {
                warn!("Module {} is unsigned; signature required", reference.sha256);
                return Err(VerifyError::SignatureMissing);
            }
            None => {
                debug!("Module {} is unsigned; signature optional", reference.sha256);
                return Ok(VerifyOutcome::Unsigned);
            }
        };

        let signer = self.check_signature(bytes, material)?;
        info!(
            "Module {} verified (signer {}, via {})",
            reference.sha256, signer, material.origin
        );
        Ok(VerifyOutcome::Verified { signer })
    }

    fn check_signature(&self, bytes: &[u8], material: &SignatureMaterial) -> Result<String, VerifyError> {
        let key_hex = material.public_key.trim().to_ascii_lowercase();
        let signer = if self.trusted.is_empty() {
            key_hex.clone()
        } else {
            self.trusted
                .get(&key_hex)
                .cloned()
                .ok_or(VerifyError::UntrustedSigner)?
        };

        let key_bytes = hex::decode(&key_hex).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let public_key =
            PublicKey::from_slice(&key_bytes).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let sig_bytes = hex::decode(material.signature.trim())
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let signature =
            Signature::from_compact(&sig_bytes).map_err(|e| VerifyError::Malformed(e.to_string()))?;

        let digest = Sha256::digest(bytes);
        let message = Message::from_digest_slice(digest.as_slice())
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;

        self.secp
            .verify_ecdsa(&message, &signature, &public_key)
            .map_err(|_| VerifyError::BadSignature)?;
        Ok(signer)
    }
}
