//! Syscall message protocol
//!
//! Requests are versioned, tagged by `op` and matched exhaustively:
//!
//! ```text
//! {"v":1,"op":"emit","event":{"type":"ci.done"}}
//! {"v":1,"op":"http.fetch","id":"a","req":{"method":"GET","url":"http://relay/x"},"limits":{"max_bytes":1024}}
//! {"v":1,"op":"kv.set","ns":"jobs","key":"k","value":"v"}
//! {"v":1,"op":"kv.get","ns":"jobs","key":"k"}
//! ```
//!
//! The legacy `syscall.`-prefixed op names are accepted as aliases.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::module::security::permissions::CapabilityKind;

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_method() -> String {
    "GET".to_string()
}

/// Decoding failures; answered with a `malformed_request` error response
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("syscall payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed syscall message: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

/// Outbound request description for `http.fetch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Per-call limits a module may request; the gateway takes the smaller of
/// these and the grant's limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchLimits {
    #[serde(default)]
    pub max_bytes: Option<usize>,
    #[serde(default)]
    pub max_kb: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl FetchLimits {
    /// Requested byte cap, preferring `max_bytes` over `max_kb`
    pub fn byte_cap(&self) -> Option<usize> {
        self.max_bytes
            .or_else(|| self.max_kb.map(|kb| kb.saturating_mul(1024)))
    }
}

/// A side effect requested by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SyscallRequest {
    #[serde(rename = "emit", alias = "syscall.emit")]
    Emit { event: Value },

    #[serde(rename = "http.fetch", alias = "syscall.http.fetch")]
    HttpFetch {
        #[serde(default)]
        id: Option<String>,
        req: HttpRequestSpec,
        #[serde(default)]
        limits: FetchLimits,
    },

    #[serde(rename = "kv.get", alias = "syscall.kv.get")]
    KvGet {
        #[serde(default)]
        ns: Option<String>,
        key: String,
    },

    #[serde(rename = "kv.set", alias = "syscall.kv.set")]
    KvSet {
        #[serde(default)]
        ns: Option<String>,
        key: String,
        value: String,
    },
}

impl SyscallRequest {
    /// Capability required to perform this request
    pub fn kind(&self) -> CapabilityKind {
        match self {
            SyscallRequest::Emit { .. } => CapabilityKind::Emit,
            SyscallRequest::HttpFetch { .. } => CapabilityKind::Http,
            SyscallRequest::KvGet { .. } | SyscallRequest::KvSet { .. } => CapabilityKind::Kv,
        }
    }

    /// Canonical op name
    pub fn op(&self) -> &'static str {
        match self {
            SyscallRequest::Emit { .. } => "emit",
            SyscallRequest::HttpFetch { .. } => "http.fetch",
            SyscallRequest::KvGet { .. } => "kv.get",
            SyscallRequest::KvSet { .. } => "kv.set",
        }
    }

    fn id(&self) -> Option<String> {
        match self {
            SyscallRequest::HttpFetch { id, .. } => id.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_version")]
    v: u32,
    #[serde(flatten)]
    request: SyscallRequest,
}

/// Decode one request line
pub fn decode_request(line: &str) -> Result<SyscallRequest, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.request)
}

/// Decode a newline-delimited batch; blank lines are skipped
pub fn decode_batch(payload: &[u8]) -> Vec<Result<SyscallRequest, ProtocolError>> {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => return vec![Err(ProtocolError::InvalidUtf8)],
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(decode_request)
        .collect()
}

/// Response disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    /// Capability, rate or size rejection; the run continues
    Denied,
    /// The request could not be understood or performed
    Error,
}

/// Response to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallResponse {
    pub v: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SyscallResponse {
    fn base(op: Option<String>, status: ResponseStatus) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            op,
            status,
            reason: None,
            id: None,
            http_status: None,
            bytes: None,
            truncated: None,
            key: None,
            found: None,
            value: None,
        }
    }

    pub fn success(request: &SyscallRequest) -> Self {
        let mut resp = Self::base(Some(request.op().to_string()), ResponseStatus::Ok);
        resp.id = request.id();
        resp
    }

    pub fn denied(request: &SyscallRequest, reason: impl Into<String>) -> Self {
        let mut resp = Self::base(Some(request.op().to_string()), ResponseStatus::Denied);
        resp.id = request.id();
        resp.reason = Some(reason.into());
        resp
    }

    pub fn error(request: Option<&SyscallRequest>, reason: impl Into<String>) -> Self {
        let mut resp = Self::base(
            request.map(|r| r.op().to_string()),
            ResponseStatus::Error,
        );
        resp.id = request.and_then(SyscallRequest::id);
        resp.reason = Some(reason.into());
        resp
    }

    /// Synthesized fetch result: status and byte count only, never the body
    pub fn http(request: &SyscallRequest, status: u16, bytes: u64, truncated: bool) -> Self {
        let mut resp = Self::success(request);
        resp.http_status = Some(status);
        resp.bytes = Some(bytes);
        resp.truncated = Some(truncated);
        resp
    }

    pub fn kv_value(request: &SyscallRequest, key: &str, value: Option<String>) -> Self {
        let mut resp = Self::success(request);
        resp.key = Some(key.to_string());
        resp.found = Some(value.is_some());
        resp.value = value;
        resp
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Encode responses as newline-delimited JSON
pub fn encode_batch(responses: &[SyscallResponse]) -> Vec<u8> {
    let mut out = Vec::new();
    for resp in responses {
        // SyscallResponse holds only strings, numbers and bools
        if let Ok(line) = serde_json::to_vec(resp) {
            out.extend_from_slice(&line);
        }
        out.push(b'\n');
    }
    out
}
