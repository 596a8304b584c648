//! Capability model for module side effects
//!
//! Whitelist-only: a run may perform exactly the side effects named in its
//! [`CapabilityGrant`], within the grant's per-kind limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::config::{CapabilityLimitsConfig, EmitLimits, HttpLimits, KvLimits};

/// Convert a capability tag to [`CapabilityKind`]
pub fn parse_capability_string(tag: &str) -> Option<CapabilityKind> {
    match tag {
        "emit" | "Emit" => Some(CapabilityKind::Emit),
        "http" | "Http" | "http.fetch" => Some(CapabilityKind::Http),
        "kv" | "Kv" => Some(CapabilityKind::Kv),
        _ => None,
    }
}

/// Side-effect classes a module can request. Closed set: unknown tags are
/// rejected by deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// Publish an event to the bus
    Emit,
    /// Outbound HTTP fetch to allowlisted hosts
    Http,
    /// Namespaced key/value reads and writes
    Kv,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [CapabilityKind::Emit, CapabilityKind::Http, CapabilityKind::Kv];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Emit => "emit",
            CapabilityKind::Http => "http",
            CapabilityKind::Kv => "kv",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a host against an allowlist.
///
/// Matching is case-insensitive and exact; `localhost` also admits the
/// IPv4 loopback literal.
pub fn host_allowed(allowlist: &[String], host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    allowlist.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        allowed == host || (allowed == "localhost" && host == "127.0.0.1")
    })
}

/// Http grant: limits plus the hosts this run may reach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGrant {
    pub limits: HttpLimits,
    pub allowed_hosts: Vec<String>,
}

/// Capabilities resolved for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    kinds: BTreeSet<CapabilityKind>,
    pub emit: EmitLimits,
    pub http: HttpGrant,
    pub kv: KvLimits,
}

impl CapabilityGrant {
    /// Build a grant for `kinds`, taking per-kind limits from configuration
    pub fn new(
        kinds: impl IntoIterator<Item = CapabilityKind>,
        limits: &CapabilityLimitsConfig,
        allowed_hosts: Vec<String>,
    ) -> Self {
        let kinds: BTreeSet<CapabilityKind> = kinds.into_iter().collect();
        debug!("Resolved capability grant: {:?}", kinds);
        Self {
            kinds,
            emit: limits.emit.clone(),
            http: HttpGrant {
                limits: limits.http.clone(),
                allowed_hosts,
            },
            kv: limits.kv.clone(),
        }
    }

    /// A grant with no capabilities
    pub fn none(limits: &CapabilityLimitsConfig) -> Self {
        Self::new(std::iter::empty(), limits, Vec::new())
    }

    /// Check if a capability is granted
    #[inline]
    pub fn has(&self, kind: CapabilityKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Granted kinds in a stable order
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        self.kinds.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Whether `host` is reachable under this grant
    pub fn http_host_allowed(&self, host: &str) -> bool {
        self.has(CapabilityKind::Http) && host_allowed(&self.http.allowed_hosts, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capability_string() {
        assert_eq!(parse_capability_string("emit"), Some(CapabilityKind::Emit));
        assert_eq!(parse_capability_string("http.fetch"), Some(CapabilityKind::Http));
        assert_eq!(parse_capability_string("Kv"), Some(CapabilityKind::Kv));
        assert_eq!(parse_capability_string("fs"), None);
    }

    #[test]
    fn test_capability_serde_is_closed() {
        let kinds: Vec<CapabilityKind> = serde_json::from_str(r#"["emit","kv"]"#).unwrap();
        assert_eq!(kinds, vec![CapabilityKind::Emit, CapabilityKind::Kv]);
        assert!(serde_json::from_str::<Vec<CapabilityKind>>(r#"["exec"]"#).is_err());
    }

    #[test]
    fn test_host_allowed() {
        let allow = vec!["relay".to_string(), "localhost".to_string()];
        assert!(host_allowed(&allow, "relay"));
        assert!(host_allowed(&allow, "LOCALHOST"));
        assert!(host_allowed(&allow, "127.0.0.1"));
        assert!(!host_allowed(&allow, "relay.evil.com"));
        assert!(!host_allowed(&allow, ""));
    }

    #[test]
    fn test_grant_membership() {
        let limits = CapabilityLimitsConfig::default();
        let grant = CapabilityGrant::new(
            [CapabilityKind::Emit, CapabilityKind::Emit],
            &limits,
            vec!["relay".to_string()],
        );
        assert!(grant.has(CapabilityKind::Emit));
        assert!(!grant.has(CapabilityKind::Http));
        assert_eq!(grant.kinds(), vec![CapabilityKind::Emit]);
        // Host list alone does not grant http
        assert!(!grant.http_host_allowed("relay"));

        let none = CapabilityGrant::none(&limits);
        assert!(none.is_empty());
    }
}
