//! Run ledger
//!
//! Owns every [`RunRecord`] and its lifecycle state machine. A record is
//! created together with a [`RunHandle`], the only way to mutate it; the
//! handle is not `Clone`, so exactly one task drives a run to its terminal
//! state. Readers get snapshots and may wait for the terminal state.
//!
//! Concurrent submissions with the same idempotency key serialize on a
//! per-key lock taken before the existing-record lookup.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::module::security::canary::Variant;
use crate::module::traits::{ErrorInfo, ExecError, ResourceUsage, RunRequest, TypedValue};
use crate::utils::current_timestamp_millis;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Admitted,
    Running,
    Finished,
    Error,
    Denied,
    Timeout,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Finished | RunState::Error | RunState::Denied | RunState::Timeout
        )
    }

    /// Allowed edges of the state machine
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, Denied)
                | (Pending, Error)
                | (Admitted, Running)
                | (Admitted, Finished)
                | (Admitted, Error)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Admitted => "admitted",
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Error => "error",
            RunState::Denied => "denied",
            RunState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state an error leads to
///
/// Admission refusals, by policy or by the verifier, end `denied`.
pub fn terminal_state_for(err: &ExecError) -> RunState {
    match err {
        ExecError::PolicyDenied(_) | ExecError::VerificationFailed(_) => RunState::Denied,
        ExecError::Timeout => RunState::Timeout,
        _ => RunState::Error,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("run {0} already exists")]
    Duplicate(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Everything recorded about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    pub request: RunRequest,
    pub usage: ResourceUsage,
    pub result: Option<Vec<TypedValue>>,
    pub error: Option<ErrorInfo>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    /// Whether policy admitted the run
    pub accepted: bool,
    pub variant: Variant,
    pub signer: Option<String>,
    /// Policy reason, or the verification failure
    pub reason: Option<String>,
}

impl RunRecord {
    fn new(run_id: String, request: RunRequest) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            request,
            usage: ResourceUsage::default(),
            result: None,
            error: None,
            created_at: current_timestamp_millis(),
            started_at: None,
            finished_at: None,
            accepted: false,
            variant: Variant::Stable,
            signer: None,
            reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Public view served by `GET /v1/runs/{id}`
    pub fn view(&self) -> RunView {
        RunView {
            run_id: self.run_id.clone(),
            status: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            usage: self.usage.clone(),
            mode: self.variant,
            signer: self.signer.clone(),
            reason: self.reason.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: String,
    pub status: RunState,
    pub result: Option<Vec<TypedValue>>,
    pub error: Option<ErrorInfo>,
    pub usage: ResourceUsage,
    pub mode: Variant,
    pub signer: Option<String>,
    pub reason: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// Run id for a submission: derived from the idempotency key when present
pub fn run_id_for(idempotency_key: Option<&str>) -> String {
    match idempotency_key {
        Some(key) => {
            let digest = Sha256::digest(format!("void-wasm-exec/run/{}", key).as_bytes());
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
        }
        None => Uuid::new_v4().to_string(),
    }
}

/// Exclusive owner of a non-terminal run
///
/// Dropping a handle before the run is terminal finalizes it as an internal
/// error so no record is left dangling.
pub struct RunHandle {
    run_id: String,
    cell: Arc<watch::Sender<RunRecord>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn snapshot(&self) -> RunRecord {
        self.cell.borrow().clone()
    }

    pub fn state(&self) -> RunState {
        self.cell.borrow().state
    }

    /// Move to a non-terminal state
    pub fn transition(&self, next: RunState) -> Result<(), LedgerError> {
        let mut outcome = Ok(());
        self.cell.send_if_modified(|record| {
            if !record.state.can_transition_to(next) || next.is_terminal() {
                outcome = Err(LedgerError::InvalidTransition {
                    from: record.state,
                    to: next,
                });
                return false;
            }
            debug!("Run {}: {} -> {}", record.run_id, record.state, next);
            record.state = next;
            if next == RunState::Running {
                record.started_at = Some(current_timestamp_millis());
            }
            true
        });
        outcome
    }

    /// Record verification and policy outcome
    pub fn set_admission(&self, accepted: bool, variant: Variant, signer: Option<String>, reason: Option<String>) {
        self.cell.send_modify(|record| {
            record.accepted = accepted;
            record.variant = variant;
            record.signer = signer;
            record.reason = reason;
        });
    }

    /// Publish an in-progress usage snapshot; counters never decrease
    pub fn publish_usage(&self, usage: &ResourceUsage) {
        self.cell.send_if_modified(|record| {
            let before = record.usage.clone();
            record.usage.merge_max(usage);
            record.usage != before
        });
    }

    /// Finalize the run and give up ownership
    pub fn finish(self, outcome: Result<Vec<TypedValue>, ExecError>, usage: &ResourceUsage) -> Result<RunRecord, LedgerError> {
        let next = match outcome {
            Ok(_) => RunState::Finished,
            Err(ref err) => terminal_state_for(err),
        };
        let mut result = Ok(());
        self.cell.send_if_modified(|record| {
            if !record.state.can_transition_to(next) {
                result = Err(LedgerError::InvalidTransition {
                    from: record.state,
                    to: next,
                });
                return false;
            }
            record.usage.merge_max(usage);
            match outcome {
                Ok(values) => record.result = Some(values),
                Err(ref err) => record.error = Some(ErrorInfo::from(err)),
            }
            record.state = next;
            record.finished_at = Some(current_timestamp_millis());
            true
        });
        result.map(|_| self.snapshot())
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cell.send_if_modified(|record| {
            if record.state.is_terminal() {
                return false;
            }
            warn!("Run {} abandoned in state {}", record.run_id, record.state);
            let err = ExecError::InternalError("run abandoned".to_string());
            record.error = Some(ErrorInfo::from(&err));
            record.state = RunState::Error;
            record.finished_at = Some(current_timestamp_millis());
            true
        });
    }
}

type KeyLocks = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Held while a submission with an idempotency key is in its critical
/// section. The last holder of a key removes the key's lock on drop.
pub struct KeyGuard {
    key: String,
    locks: KeyLocks,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // map entry + our guard; any waiter holds a third reference
        let idle = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// In-process record table
#[derive(Default)]
pub struct RunLedger {
    records: RwLock<HashMap<String, Arc<watch::Sender<RunRecord>>>>,
    key_locks: KeyLocks,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize submissions sharing an idempotency key
    pub async fn lock_key(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.key_locks),
            _guard: lock.lock_owned().await,
        }
    }

    /// Idempotency keys with a live lock
    pub fn key_lock_count(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Create a `pending` record and return its owner handle
    pub async fn create(&self, run_id: String, request: RunRequest) -> Result<RunHandle, LedgerError> {
        let mut records = self.records.write().await;
        if records.contains_key(&run_id) {
            return Err(LedgerError::Duplicate(run_id));
        }
        let (cell, _) = watch::channel(RunRecord::new(run_id.clone(), request));
        let cell = Arc::new(cell);
        records.insert(run_id.clone(), Arc::clone(&cell));
        debug!("Run {} created", run_id);
        Ok(RunHandle { run_id, cell })
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        let records = self.records.read().await;
        records.get(run_id).map(|cell| cell.borrow().clone())
    }

    /// Lookup by idempotency key
    pub async fn find_by_key(&self, idempotency_key: &str) -> Option<RunRecord> {
        self.get(&run_id_for(Some(idempotency_key))).await
    }

    /// Wait until the run reaches a terminal state; `None` for unknown runs
    pub async fn wait_for_terminal(&self, run_id: &str) -> Option<RunRecord> {
        let mut rx = {
            let records = self.records.read().await;
            records.get(run_id)?.subscribe()
        };
        let terminal = rx
            .wait_for(|record| record.is_terminal())
            .await
            .map(|record| record.clone())
            .ok();
        Some(terminal.unwrap_or_else(|| rx.borrow().clone()))
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::security::permissions::CapabilityKind;
    use crate::module::traits::{ModuleReference, ResourceKind};
    use proptest::prelude::*;

    fn request() -> RunRequest {
        RunRequest::new(
            ModuleReference::new("ab".repeat(32), "add(i32,i32)->i32".parse().unwrap()),
            "alice",
        )
    }

    #[test]
    fn test_run_id_is_stable_per_key() {
        assert_eq!(run_id_for(Some("k1")), run_id_for(Some("k1")));
        assert_ne!(run_id_for(Some("k1")), run_id_for(Some("k2")));
        assert_ne!(run_id_for(None), run_id_for(None));
        assert!(Uuid::parse_str(&run_id_for(Some("k1"))).is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_to_finished() {
        let ledger = RunLedger::new();
        let handle = ledger.create("r1".into(), request()).await.unwrap();
        assert_eq!(
            ledger.create("r1".into(), request()).await.err(),
            Some(LedgerError::Duplicate("r1".into()))
        );
        handle.transition(RunState::Admitted).unwrap();
        handle.transition(RunState::Running).unwrap();
        assert!(handle.transition(RunState::Pending).is_err());

        let mut usage = ResourceUsage::default();
        usage.cpu_ms = 4;
        usage.record_syscall(CapabilityKind::Http, false);
        let record = handle.finish(Ok(vec![TypedValue::I32(5)]), &usage).unwrap();
        assert_eq!(record.state, RunState::Finished);
        assert_eq!(record.result, Some(vec![TypedValue::I32(5)]));
        assert!(record.started_at.is_some() && record.finished_at.is_some());

        let stored = ledger.get("r1").await.unwrap();
        assert_eq!(stored.usage.counts(CapabilityKind::Http).rejected, 1);
    }

    #[tokio::test]
    async fn test_error_states() {
        let ledger = RunLedger::new();
        let handle = ledger.create("denied".into(), request()).await.unwrap();
        let record = handle
            .finish(Err(ExecError::PolicyDenied("service_disabled".into())), &ResourceUsage::default())
            .unwrap();
        assert_eq!(record.state, RunState::Denied);
        assert_eq!(record.error.unwrap().kind, "policy_denied");

        let handle = ledger.create("mem".into(), request()).await.unwrap();
        handle.transition(RunState::Admitted).unwrap();
        handle.transition(RunState::Running).unwrap();
        let record = handle
            .finish(Err(ExecError::ResourceExceeded(ResourceKind::Memory)), &ResourceUsage::default())
            .unwrap();
        assert_eq!(record.state, RunState::Error);

        // timeout only from running
        let handle = ledger.create("t".into(), request()).await.unwrap();
        assert!(handle.finish(Err(ExecError::Timeout), &ResourceUsage::default()).is_err());
        // the dropped handle finalized the record
        assert_eq!(ledger.get("t").await.unwrap().state, RunState::Error);
    }

    #[tokio::test]
    async fn test_wait_for_terminal_and_usage_monotonic() {
        let ledger = Arc::new(RunLedger::new());
        let handle = ledger.create("w".into(), request()).await.unwrap();
        handle.transition(RunState::Admitted).unwrap();
        handle.transition(RunState::Running).unwrap();

        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.wait_for_terminal("w").await })
        };

        let mut high = ResourceUsage::default();
        high.cpu_ms = 10;
        handle.publish_usage(&high);
        let mut low = ResourceUsage::default();
        low.cpu_ms = 3;
        handle.publish_usage(&low);
        assert_eq!(handle.snapshot().usage.cpu_ms, 10);

        handle.finish(Err(ExecError::Timeout), &low).unwrap();
        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.state, RunState::Timeout);
        assert_eq!(record.usage.cpu_ms, 10);
        assert!(ledger.wait_for_terminal("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_verification_failure_is_denied() {
        let ledger = RunLedger::new();
        let handle = ledger.create("unsigned".into(), request()).await.unwrap();
        let record = handle
            .finish(
                Err(ExecError::VerificationFailed("signature_missing".into())),
                &ResourceUsage::default(),
            )
            .unwrap();
        assert_eq!(record.state, RunState::Denied);
        assert_eq!(record.error.unwrap().kind, "verify_failed");
    }

    #[tokio::test]
    async fn test_key_locks_do_not_accumulate() {
        let ledger = Arc::new(RunLedger::new());
        for i in 0..100 {
            let _guard = ledger.lock_key(&format!("key-{}", i)).await;
            assert_eq!(ledger.key_lock_count(), 1);
        }
        assert_eq!(ledger.key_lock_count(), 0);

        // a queued submitter keeps the lock alive past the first holder
        let first = ledger.lock_key("shared").await;
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let _guard = ledger.lock_key("shared").await;
            })
        };
        while ledger
            .key_locks
            .lock()
            .unwrap()
            .get("shared")
            .map_or(0, Arc::strong_count)
            < 3
        {
            tokio::task::yield_now().await;
        }
        drop(first);
        assert_eq!(ledger.key_lock_count(), 1);
        waiter.await.unwrap();
        assert_eq!(ledger.key_lock_count(), 0);
    }

    fn any_state() -> impl Strategy<Value = RunState> {
        prop_oneof![
            Just(RunState::Pending),
            Just(RunState::Admitted),
            Just(RunState::Running),
            Just(RunState::Finished),
            Just(RunState::Error),
            Just(RunState::Denied),
            Just(RunState::Timeout),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_states_are_final(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            if from.can_transition_to(to) {
                prop_assert_ne!(from, to);
                prop_assert_ne!(to, RunState::Pending);
            }
        }
    }
}
