//! Core executor types
//!
//! Module references, entry signatures, typed values, run requests, usage
//! counters and the error taxonomy shared by every component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::module::security::permissions::CapabilityKind;

/// Wasm scalar types usable at the entry boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "i32" => Ok(ValueType::I32),
            "i64" => Ok(ValueType::I64),
            "f32" => Ok(ValueType::F32),
            "f64" => Ok(ValueType::F64),
            other => Err(format!("unsupported value type '{}'", other)),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged scalar passed to or returned from the entry function
///
/// JSON form: `{"type": "i32", "value": 5}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::I32(_) => ValueType::I32,
            TypedValue::I64(_) => ValueType::I64,
            TypedValue::F32(_) => ValueType::F32,
            TypedValue::F64(_) => ValueType::F64,
        }
    }
}

/// Entry function name plus its typed parameter and result lists
///
/// Written as `name(t1,t2)->t`, e.g. `add(i32,i32)->i32`; `run()` has no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntrySignature {
    pub name: String,
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl EntrySignature {
    pub fn new(name: impl Into<String>, params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self {
            name: name.into(),
            params,
            results,
        }
    }

    /// Check a typed argument list against the parameter list
    pub fn check_args(&self, args: &[TypedValue]) -> Result<(), String> {
        if args.len() != self.params.len() {
            return Err(format!(
                "entry '{}' takes {} argument(s), got {}",
                self.name,
                self.params.len(),
                args.len()
            ));
        }
        for (i, (arg, expected)) in args.iter().zip(&self.params).enumerate() {
            if arg.value_type() != *expected {
                return Err(format!(
                    "argument {} of '{}' must be {}, got {}",
                    i,
                    self.name,
                    expected,
                    arg.value_type()
                ));
            }
        }
        Ok(())
    }
}

fn parse_type_list(list: &str) -> Result<Vec<ValueType>, String> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(Vec::new());
    }
    list.split(',').map(ValueType::from_str).collect()
}

impl FromStr for EntrySignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let open = s
            .find('(')
            .ok_or_else(|| format!("entry signature '{}' is missing '('", s))?;
        let close = s[open..]
            .find(')')
            .map(|c| open + c)
            .ok_or_else(|| format!("entry signature '{}' is missing ')'", s))?;
        let name = s[..open].trim();
        if name.is_empty() {
            return Err("entry signature has an empty function name".to_string());
        }
        let params = parse_type_list(&s[open + 1..close])?;
        let rest = s[close + 1..].trim();
        let results = if rest.is_empty() {
            Vec::new()
        } else {
            let rest = rest
                .strip_prefix("->")
                .ok_or_else(|| format!("unexpected trailing text '{}'", rest))?;
            let rest = rest.trim();
            let rest = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .unwrap_or(rest);
            parse_type_list(rest)?
        };
        Ok(Self::new(name, params, results))
    }
}

impl TryFrom<String> for EntrySignature {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntrySignature> for String {
    fn from(sig: EntrySignature) -> Self {
        sig.to_string()
    }
}

impl fmt::Display for EntrySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[ValueType]| {
            types
                .iter()
                .map(ValueType::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(f, "{}({})", self.name, join(&self.params))?;
        match self.results.len() {
            0 => Ok(()),
            1 => write!(f, "->{}", self.results[0]),
            _ => write!(f, "->({})", join(&self.results)),
        }
    }
}

/// Immutable identifier of compute content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReference {
    /// Content address: lowercase hex SHA-256 of the module bytes
    pub sha256: String,
    /// Where to fetch the bytes when not cached (`file://`, `http(s)://`, `ipfs://`)
    #[serde(default)]
    pub source: Option<String>,
    /// Logical module name matched against the module allowlist
    #[serde(default)]
    pub name: Option<String>,
    /// Entry point invoked after instantiation
    pub entry: EntrySignature,
    /// Inline signature (compact secp256k1, hex)
    #[serde(default)]
    pub signature: Option<String>,
    /// Inline signer key (compressed secp256k1, hex)
    #[serde(default)]
    pub public_key: Option<String>,
}

impl ModuleReference {
    pub fn new(sha256: impl Into<String>, entry: EntrySignature) -> Self {
        Self {
            sha256: sha256.into(),
            source: None,
            name: None,
            entry,
            signature: None,
            public_key: None,
        }
    }

    /// Whether `sha256` is a well-formed lowercase hex digest
    pub fn has_valid_digest(&self) -> bool {
        self.sha256.len() == 64
            && self
                .sha256
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

/// Resource ceilings a request asks for; unset values default to the maxima
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLimits {
    #[serde(default)]
    pub memory_pages: Option<u32>,
    #[serde(default)]
    pub cpu_ms: Option<u64>,
    #[serde(default)]
    pub wall_ms: Option<u64>,
    /// Hosts the module intends to reach through `http.fetch`
    #[serde(default)]
    pub http_hosts: Vec<String>,
}

/// A request to execute one module entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub module: ModuleReference,
    #[serde(default)]
    pub args: Vec<TypedValue>,
    pub principal: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityKind>,
    #[serde(default)]
    pub limits: RequestedLimits,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl RunRequest {
    pub fn new(module: ModuleReference, principal: impl Into<String>) -> Self {
        Self {
            module,
            args: Vec::new(),
            principal: principal.into(),
            labels: BTreeMap::new(),
            capabilities: Vec::new(),
            limits: RequestedLimits::default(),
            idempotency_key: None,
        }
    }

    pub fn entry(&self) -> &EntrySignature {
        &self.module.entry
    }
}

/// Resolved ceilings enforced on one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_pages: u32,
    pub cpu_ms: u64,
    pub wall_ms: u64,
}

/// Resource whose ceiling was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => f.write_str("memory"),
            ResourceKind::Cpu => f.write_str("cpu"),
        }
    }
}

/// Allowed/rejected counts for one capability kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallCounts {
    pub allowed: u64,
    pub rejected: u64,
}

/// Usage counters recorded on a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub memory_pages: u32,
    pub syscalls: BTreeMap<CapabilityKind, SyscallCounts>,
    /// Syscall messages that could not be decoded
    pub malformed: u64,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            cpu_ms: 0,
            memory_pages: 0,
            syscalls: CapabilityKind::ALL
                .iter()
                .map(|k| (*k, SyscallCounts::default()))
                .collect(),
            malformed: 0,
        }
    }
}

impl ResourceUsage {
    pub fn record_syscall(&mut self, kind: CapabilityKind, allowed: bool) {
        let counts = self.syscalls.entry(kind).or_default();
        if allowed {
            counts.allowed += 1;
        } else {
            counts.rejected += 1;
        }
    }

    pub fn counts(&self, kind: CapabilityKind) -> SyscallCounts {
        self.syscalls.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_syscalls(&self) -> u64 {
        self.syscalls
            .values()
            .map(|c| c.allowed + c.rejected)
            .sum::<u64>()
            + self.malformed
    }

    /// Merge by taking the max of every counter, so a published usage never
    /// moves backwards.
    pub fn merge_max(&mut self, other: &ResourceUsage) {
        self.cpu_ms = self.cpu_ms.max(other.cpu_ms);
        self.memory_pages = self.memory_pages.max(other.memory_pages);
        self.malformed = self.malformed.max(other.malformed);
        for (kind, theirs) in &other.syscalls {
            let ours = self.syscalls.entry(*kind).or_default();
            ours.allowed = ours.allowed.max(theirs.allowed);
            ours.rejected = ours.rejected.max(theirs.rejected);
        }
    }

    /// True when no counter of `self` is below the matching counter of `earlier`
    pub fn dominates(&self, earlier: &ResourceUsage) -> bool {
        self.cpu_ms >= earlier.cpu_ms
            && self.memory_pages >= earlier.memory_pages
            && self.malformed >= earlier.malformed
            && earlier.syscalls.iter().all(|(kind, e)| {
                let c = self.counts(*kind);
                c.allowed >= e.allowed && c.rejected >= e.rejected
            })
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceUsage::default()
    }
}

/// Executor error taxonomy
///
/// Side effects performed before an error are not rolled back: emitted
/// events, fetches and kv writes are externally visible at least once.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("verify_failed: {0}")]
    VerificationFailed(String),
    #[error("resource exceeded: {0}")]
    ResourceExceeded(ResourceKind),
    #[error("wall-clock budget exhausted")]
    Timeout,
    #[error("runtime fault: {0}")]
    RuntimeFault(String),
    #[error("gateway rejected {capability}: {reason}")]
    GatewayRejected {
        capability: CapabilityKind,
        reason: String,
    },
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ExecError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::PolicyDenied(_) => "policy_denied",
            ExecError::VerificationFailed(_) => "verify_failed",
            ExecError::ResourceExceeded(_) => "resource_exceeded",
            ExecError::Timeout => "timeout",
            ExecError::RuntimeFault(_) => "runtime_fault",
            ExecError::GatewayRejected { .. } => "gateway_rejected",
            ExecError::InternalError(_) => "internal_error",
        }
    }

    /// Only internal errors may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::InternalError(_))
    }

    /// Whether this error ends the run (gateway rejections do not)
    pub fn aborts_run(&self) -> bool {
        !matches!(self, ExecError::GatewayRejected { .. })
    }
}

/// Serializable error attached to a run record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub detail: String,
    pub retryable: bool,
}

impl From<&ExecError> for ErrorInfo {
    fn from(err: &ExecError) -> Self {
        Self {
            kind: err.kind().to_string(),
            detail: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
