//! Shared fixtures for executor integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use void_wasm_exec::config::ExecConfig;
use void_wasm_exec::module::api::events::{ChannelEventSink, EventEnvelope};
use void_wasm_exec::module::api::http::{FetchError, FetchOutcome, FetchRequest, HttpFetcher};
use void_wasm_exec::module::manager::{ExecutionManager, ManagerDeps};
use void_wasm_exec::module::registry::store::ModuleStore;
use void_wasm_exec::module::security::permissions::CapabilityKind;
use void_wasm_exec::module::traits::{ModuleReference, RunRequest, TypedValue};

pub const ADD: &str = r#"(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))"#;

pub const SPIN: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "run") (loop $l br $l)))"#;

/// Escape a syscall batch for a wat data string
pub fn wat_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Module whose `run()->i32` sends `batch` in one syscall and returns the
/// response length
pub fn syscall_module(batch: &str) -> String {
    format!(
        r#"(module
  (import "void" "syscall" (func $sys (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{}")
  (func (export "run") (result i32)
    (call $sys (i32.const 0) (i32.const {}) (i32.const 16384) (i32.const 32768))))"#,
        wat_escape(batch),
        batch.len()
    )
}

/// `add(i32,i32)->i32` that attempts one `http.fetch` before returning the sum
pub fn add_with_fetch() -> String {
    let request = r#"{"op":"http.fetch","id":"f1","req":{"url":"http://relay/status"}}"#;
    format!(
        r#"(module
  (import "void" "syscall" (func $sys (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{}")
  (func (export "add") (param i32 i32) (result i32)
    (drop (call $sys (i32.const 0) (i32.const {}) (i32.const 1024) (i32.const 1024)))
    local.get 0
    local.get 1
    i32.add))"#,
        wat_escape(request),
        request.len()
    )
}

/// Fetcher that answers every request with `200` and 42 bytes
#[derive(Default)]
pub struct FakeFetcher {
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchOutcome {
            status: 200,
            bytes: 42u64.min(request.max_bytes as u64),
            truncated: request.max_bytes < 42,
        })
    }
}

/// Configuration allowing every capability
pub fn permissive_config() -> ExecConfig {
    let mut config = ExecConfig::default();
    config.policy.rules.allowed_capabilities = CapabilityKind::ALL.to_vec();
    config
}

pub struct Harness {
    pub manager: Arc<ExecutionManager>,
    pub events: UnboundedReceiver<EventEnvelope>,
    pub fetcher: Arc<FakeFetcher>,
    pub store: Arc<ModuleStore>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(mut config: ExecConfig) -> Self {
        let dir = TempDir::new().unwrap();
        config.store.cache_dir = dir.path().join("modules");
        let store = Arc::new(ModuleStore::new(config.store.clone()).unwrap());
        let fetcher = Arc::new(FakeFetcher::default());
        let (sink, events) = ChannelEventSink::new();
        let deps = ManagerDeps {
            store: Arc::clone(&store),
            fetcher: fetcher.clone(),
            sink: Arc::new(sink),
            decision: None,
        };
        let manager = ExecutionManager::new(Arc::new(config), deps).unwrap();
        Self {
            manager: Arc::new(manager),
            events,
            fetcher,
            store,
            _dir: dir,
        }
    }

    /// Compile `wat_src` and register it; returns the content address
    pub async fn register(&self, wat_src: &str) -> String {
        let bytes = wat::parse_str(wat_src).unwrap();
        self.store.insert(bytes).await
    }

    /// Events published up to and including the first terminal lifecycle
    /// event, plus anything already queued behind it
    pub async fn drain_events(&mut self) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no terminal lifecycle event")
                .expect("event channel closed");
            let terminal = event.event_type == "run.finished" || event.event_type == "run.error";
            events.push(event);
            if terminal {
                break;
            }
        }
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn run_request(
    sha256: &str,
    entry: &str,
    args: Vec<TypedValue>,
    principal: &str,
    capabilities: &[CapabilityKind],
) -> RunRequest {
    let mut request = RunRequest::new(
        ModuleReference::new(sha256, entry.parse().unwrap()),
        principal,
    );
    request.args = args;
    request.capabilities = capabilities.to_vec();
    request
}
