//! Configuration management for the executor
//!
//! One immutable [`ExecConfig`] is loaded at startup (TOML or JSON), validated,
//! wrapped in an `Arc` and handed to every component constructor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::module::security::permissions::CapabilityKind;

/// Size of one WebAssembly linear memory page
pub const WASM_PAGE_BYTES: u64 = 65_536;

/// Largest page count a 32-bit linear memory can address
pub const MAX_WASM_PAGES: u32 = 65_536;

/// Top-level executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Maximum number of runs executing at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Admit runs but never instantiate them (runs finish with no result)
    #[serde(default)]
    pub dry_run: bool,

    /// Admission policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Resource ceilings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-capability limits applied by the syscall gateway
    #[serde(default)]
    pub capabilities: CapabilityLimitsConfig,

    /// Module provenance
    #[serde(default)]
    pub signature: SignatureConfig,

    /// Module fetching and caching
    #[serde(default)]
    pub store: ModuleStoreConfig,

    /// Lifecycle notification delivery
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_max_concurrent_runs() -> usize {
    4
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_concurrent_runs: default_max_concurrent_runs(),
            dry_run: false,
            policy: PolicyConfig::default(),
            limits: LimitsConfig::default(),
            capabilities: CapabilityLimitsConfig::default(),
            signature: SignatureConfig::default(),
            store: ModuleStoreConfig::default(),
            events: EventsConfig::default(),
            logging: None,
        }
    }
}

/// Admission policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Kill switch: `false` denies every request
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Freeze: admit with minimal capabilities and skip every other check
    #[serde(default)]
    pub freeze: bool,

    /// Capabilities still granted while frozen
    #[serde(default = "default_freeze_capabilities")]
    pub freeze_capabilities: Vec<CapabilityKind>,

    /// Stable rule variant
    #[serde(default)]
    pub rules: RuleSet,

    /// Canary routing
    #[serde(default)]
    pub canary: CanaryConfig,

    /// Optional external decision service
    #[serde(default)]
    pub decision: Option<DecisionServiceConfig>,
}

fn default_freeze_capabilities() -> Vec<CapabilityKind> {
    vec![CapabilityKind::Emit]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freeze: false,
            freeze_capabilities: default_freeze_capabilities(),
            rules: RuleSet::default(),
            canary: CanaryConfig::default(),
            decision: None,
        }
    }
}

/// A rule variant (stable or canary)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    /// Capabilities a request may ask for
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<CapabilityKind>,

    /// Hosts reachable through `http.fetch`
    #[serde(default = "default_allowed_http_hosts")]
    pub allowed_http_hosts: Vec<String>,

    /// Module name patterns (`*` suffix matches a prefix); empty allows any module
    #[serde(default)]
    pub allowed_modules: Vec<String>,
}

fn default_allowed_capabilities() -> Vec<CapabilityKind> {
    vec![CapabilityKind::Emit]
}

fn default_allowed_http_hosts() -> Vec<String> {
    vec!["relay".to_string(), "localhost".to_string()]
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            allowed_capabilities: default_allowed_capabilities(),
            allowed_http_hosts: default_allowed_http_hosts(),
            allowed_modules: Vec::new(),
        }
    }
}

/// Canary routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Fraction of traffic routed to the canary variant, in `[0, 1]`
    #[serde(default)]
    pub fraction: f64,

    /// Width of the timestamp bucket used when a request has no idempotency key
    #[serde(default = "default_canary_bucket_secs")]
    pub bucket_secs: u64,

    /// Canary rules; the stable rules apply when absent
    #[serde(default)]
    pub rules: Option<RuleSet>,
}

fn default_canary_bucket_secs() -> u64 {
    60
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            fraction: 0.0,
            bucket_secs: default_canary_bucket_secs(),
            rules: None,
        }
    }
}

/// External decision service (`POST {"input": ...}` -> `{"result": bool}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionServiceConfig {
    /// Full decision URL
    pub url: String,

    /// Request timeout
    #[serde(default = "default_decision_timeout_ms")]
    pub timeout_ms: u64,

    /// Outcome used when the service errors or times out
    #[serde(default)]
    pub default_allow: bool,
}

fn default_decision_timeout_ms() -> u64 {
    500
}

/// Resource ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum linear memory, in 64 KiB pages
    #[serde(default = "default_max_memory_pages")]
    pub max_memory_pages: u32,

    /// Maximum guest cpu time
    #[serde(default = "default_max_cpu_ms")]
    pub max_cpu_ms: u64,

    /// Maximum wall-clock time
    #[serde(default = "default_max_wall_ms")]
    pub max_wall_ms: u64,

    /// Interval between execution checkpoints
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
}

fn default_max_memory_pages() -> u32 {
    // 128 MiB
    2048
}

fn default_max_cpu_ms() -> u64 {
    2000
}

fn default_max_wall_ms() -> u64 {
    2000
}

fn default_checkpoint_interval_ms() -> u64 {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: default_max_memory_pages(),
            max_cpu_ms: default_max_cpu_ms(),
            max_wall_ms: default_max_wall_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

/// Limits for every capability kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityLimitsConfig {
    #[serde(default)]
    pub emit: EmitLimits,
    #[serde(default)]
    pub http: HttpLimits,
    #[serde(default)]
    pub kv: KvLimits,
}

/// Emit capability limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmitLimits {
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_emit_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_rate_per_sec() -> u32 {
    5
}

fn default_burst() -> u32 {
    5
}

fn default_emit_max_payload_bytes() -> usize {
    16 * 1024
}

impl Default for EmitLimits {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            max_payload_bytes: default_emit_max_payload_bytes(),
        }
    }
}

/// Http capability limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpLimits {
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Response bytes read before truncation
    #[serde(default = "default_http_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_max_response_bytes() -> usize {
    64 * 1024
}

fn default_http_timeout_ms() -> u64 {
    1500
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
            max_response_bytes: default_http_max_response_bytes(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Kv capability limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvLimits {
    #[serde(default = "default_kv_rate_per_sec")]
    pub rate_per_sec: u32,
    #[serde(default = "default_kv_burst")]
    pub burst: u32,
    /// Distinct keys per namespace
    #[serde(default = "default_kv_max_keys")]
    pub max_keys: usize,
    #[serde(default = "default_kv_max_value_bytes")]
    pub max_value_bytes: usize,
}

fn default_kv_rate_per_sec() -> u32 {
    50
}

fn default_kv_burst() -> u32 {
    100
}

fn default_kv_max_keys() -> usize {
    1024
}

fn default_kv_max_value_bytes() -> usize {
    4096
}

impl Default for KvLimits {
    fn default() -> Self {
        Self {
            rate_per_sec: default_kv_rate_per_sec(),
            burst: default_kv_burst(),
            max_keys: default_kv_max_keys(),
            max_value_bytes: default_kv_max_value_bytes(),
        }
    }
}

/// Signature policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Refuse modules without a valid signature
    #[serde(default)]
    pub required: bool,

    /// Signer identity -> compressed secp256k1 public key (hex).
    /// Empty accepts any key that produces a valid signature.
    #[serde(default)]
    pub trusted_signers: HashMap<String, String>,
}

/// Module store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStoreConfig {
    /// Content-addressed cache directory (`<sha256>.wasm`)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Gateway used for `ipfs://<cid>` sources
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,

    /// Largest accepted module
    #[serde(default = "default_max_module_bytes")]
    pub max_module_bytes: usize,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/modules")
}

fn default_ipfs_gateway() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_max_module_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

impl Default for ModuleStoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ipfs_gateway: default_ipfs_gateway(),
            max_module_bytes: default_max_module_bytes(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

/// Lifecycle event delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Event bus endpoint; events are only logged when unset
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_event_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_event_timeout_ms() -> u64 {
    1000
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_event_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "void_wasm_exec=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

impl ExecConfig {
    /// Load configuration from a file, choosing the format by extension
    /// (`.json` is JSON, anything else is TOML) and validating it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path)?,
            _ => Self::from_toml_file(path)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExecConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExecConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(anyhow::anyhow!("max_concurrent_runs must be greater than 0"));
        }
        self.limits.validate()?;
        self.policy.validate()?;
        self.capabilities.validate()?;
        self.signature.validate()?;
        if self.store.max_module_bytes == 0 {
            return Err(anyhow::anyhow!("store.max_module_bytes must be greater than 0"));
        }
        Ok(())
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_memory_pages == 0 || self.max_memory_pages > MAX_WASM_PAGES {
            return Err(anyhow::anyhow!(
                "limits.max_memory_pages must be in 1..={}",
                MAX_WASM_PAGES
            ));
        }
        if self.max_cpu_ms == 0 || self.max_wall_ms == 0 {
            return Err(anyhow::anyhow!(
                "limits.max_cpu_ms and limits.max_wall_ms must be greater than 0"
            ));
        }
        if self.checkpoint_interval_ms == 0 || self.checkpoint_interval_ms > self.max_wall_ms {
            return Err(anyhow::anyhow!(
                "limits.checkpoint_interval_ms must be in 1..=max_wall_ms"
            ));
        }
        Ok(())
    }

    /// Memory ceiling in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        u64::from(self.max_memory_pages) * WASM_PAGE_BYTES
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let fraction = self.canary.fraction;
        if !(0.0..=1.0).contains(&fraction) || fraction.is_nan() {
            return Err(anyhow::anyhow!(
                "policy.canary.fraction must be within [0, 1], got {}",
                fraction
            ));
        }
        if self.canary.bucket_secs == 0 {
            return Err(anyhow::anyhow!("policy.canary.bucket_secs must be greater than 0"));
        }
        if let Some(ref decision) = self.decision {
            if decision.url.trim().is_empty() {
                return Err(anyhow::anyhow!("policy.decision.url must not be empty"));
            }
            if decision.timeout_ms == 0 {
                return Err(anyhow::anyhow!("policy.decision.timeout_ms must be greater than 0"));
            }
        }
        Ok(())
    }
}

impl CapabilityLimitsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.emit.burst == 0 || self.http.burst == 0 || self.kv.burst == 0 {
            return Err(anyhow::anyhow!("capability burst limits must be greater than 0"));
        }
        if self.http.timeout_ms == 0 {
            return Err(anyhow::anyhow!("capabilities.http.timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

impl SignatureConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (identity, key_hex) in &self.trusted_signers {
            let bytes = hex::decode(key_hex).map_err(|e| {
                anyhow::anyhow!("trusted signer '{}' has a non-hex key: {}", identity, e)
            })?;
            secp256k1::PublicKey::from_slice(&bytes).map_err(|e| {
                anyhow::anyhow!("trusted signer '{}' has an invalid key: {}", identity, e)
            })?;
        }
        Ok(())
    }
}
