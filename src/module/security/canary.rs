//! Deterministic canary routing
//!
//! A request lands in the canary variant when the first eight bytes of a
//! domain-separated SHA-256 of its routing key, read as a big-endian integer,
//! fall below `fraction * 2^64`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::CanaryConfig;

const CANARY_DOMAIN: &[u8] = b"void-wasm-exec:canary:v1";

/// Rule variant a request is evaluated under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Stable,
    Canary,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Stable => f.write_str("stable"),
            Variant::Canary => f.write_str("canary"),
        }
    }
}

/// Routes a configured fraction of traffic to the canary variant
#[derive(Debug, Clone)]
pub struct CanaryController {
    fraction: f64,
    bucket_secs: u64,
}

impl CanaryController {
    pub fn new(config: &CanaryConfig) -> Self {
        Self {
            fraction: config.fraction.clamp(0.0, 1.0),
            bucket_secs: config.bucket_secs.max(1),
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Routing key: the idempotency key when present, otherwise the
    /// principal plus the current timestamp bucket.
    pub fn routing_key(&self, idempotency_key: Option<&str>, principal: &str, now_secs: u64) -> String {
        match idempotency_key {
            Some(key) => format!("key:{}", key),
            None => format!("principal:{}:{}", principal, now_secs / self.bucket_secs),
        }
    }

    /// Pick the variant for a routing key
    pub fn select(&self, routing_key: &str) -> Variant {
        if self.fraction <= 0.0 {
            return Variant::Stable;
        }
        if self.fraction >= 1.0 {
            return Variant::Canary;
        }
        let point = hash_point(routing_key);
        // fraction * 2^64, saturating at u64::MAX
        let threshold = (self.fraction * 18_446_744_073_709_551_616.0) as u64;
        if point < threshold {
            Variant::Canary
        } else {
            Variant::Stable
        }
    }

    /// Convenience: route a request by its fields
    pub fn route(&self, idempotency_key: Option<&str>, principal: &str, now_secs: u64) -> Variant {
        self.select(&self.routing_key(idempotency_key, principal, now_secs))
    }
}

fn hash_point(routing_key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(CANARY_DOMAIN);
    hasher.update(routing_key.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
