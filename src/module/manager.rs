//! Execution manager: admission, scheduling and finalization of runs
//!
//! A submission is resolved to module bytes, verified, evaluated by policy and
//! recorded in the ledger before it is admitted. Admitted runs execute in the
//! background, bounded by `max_concurrent_runs`, and publish lifecycle events.
//!
//! Side effects a run performs through the syscall gateway (events, fetches,
//! kv writes) are not rolled back when the run later fails.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecConfig;
use crate::module::api::events::{sink_from_config, EventPublisher, EventSink, LifecycleEvent};
use crate::module::api::gateway::SyscallGateway;
use crate::module::api::http::{HttpFetcher, ReqwestFetcher};
use crate::module::api::kv::KvStore;
use crate::module::ledger::{run_id_for, RunHandle, RunLedger, RunRecord, RunState, RunView};
use crate::module::registry::store::{ModuleStore, ModuleStoreError};
use crate::module::sandbox::runtime::{ExecutionPlan, SandboxRuntime};
use crate::module::security::canary::Variant;
use crate::module::security::decision::{DecisionClient, HttpDecisionClient};
use crate::module::security::policy::PolicyEngine;
use crate::module::security::signature::SignatureVerifier;
use crate::module::traits::{ExecError, ResourceUsage, RunRequest, TypedValue};
use crate::utils::current_timestamp;

/// Response to `POST /v1/exec`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub run_id: String,
    pub accepted: bool,
    pub mode: Variant,
}

impl From<&RunRecord> for SubmitOutcome {
    fn from(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            accepted: record.accepted,
            mode: record.variant,
        }
    }
}

/// Pluggable collaborators; `from_config` builds the production set
pub struct ManagerDeps {
    pub store: Arc<ModuleStore>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub sink: Arc<dyn EventSink>,
    pub decision: Option<Arc<dyn DecisionClient>>,
}

impl ManagerDeps {
    pub fn from_config(config: &ExecConfig) -> anyhow::Result<Self> {
        let store = ModuleStore::new(config.store.clone())?;
        let fetcher = ReqwestFetcher::new()?;
        let sink = sink_from_config(&config.events)?;
        let decision: Option<Arc<dyn DecisionClient>> = match config.policy.decision {
            Some(ref decision) => Some(Arc::new(HttpDecisionClient::new(decision)?)),
            None => None,
        };
        Ok(Self {
            store: Arc::new(store),
            fetcher: Arc::new(fetcher),
            sink,
            decision,
        })
    }
}

pub struct ExecutionManager {
    config: Arc<ExecConfig>,
    store: Arc<ModuleStore>,
    verifier: SignatureVerifier,
    policy: PolicyEngine,
    runtime: Arc<SandboxRuntime>,
    gateway: Arc<SyscallGateway>,
    ledger: Arc<RunLedger>,
    events: Arc<EventPublisher>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ExecutionManager {
    pub fn new(config: Arc<ExecConfig>, deps: ManagerDeps) -> Result<Self, ExecError> {
        let events = Arc::new(EventPublisher::new(deps.sink));
        let gateway = Arc::new(SyscallGateway::new(
            Arc::new(KvStore::new()),
            deps.fetcher,
            Arc::clone(&events),
        ));
        let runtime = Arc::new(SandboxRuntime::new(&config, Arc::clone(&gateway))?);
        let mut policy = PolicyEngine::new(Arc::clone(&config));
        if let Some(client) = deps.decision {
            policy = policy.with_decision_client(client);
        }
        info!(
            "Execution manager ready (max {} concurrent runs, dry_run={})",
            config.max_concurrent_runs, config.dry_run
        );
        Ok(Self {
            verifier: SignatureVerifier::new(&config.signature),
            permits: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            store: deps.store,
            policy,
            runtime,
            gateway,
            ledger: Arc::new(RunLedger::new()),
            events,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn from_config(config: Arc<ExecConfig>) -> anyhow::Result<Self> {
        let deps = ManagerDeps::from_config(&config)?;
        Ok(Self::new(config, deps)?)
    }

    pub fn config(&self) -> &Arc<ExecConfig> {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<ModuleStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<SyscallGateway> {
        &self.gateway
    }

    /// Submit a run. Returns once the run is denied or admitted; admitted runs
    /// continue in the background.
    pub async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecError> {
        let _key_guard = match request.idempotency_key {
            Some(ref key) => {
                let guard = self.ledger.lock_key(key).await;
                if let Some(existing) = self.ledger.find_by_key(key).await {
                    debug!("Idempotency key {} maps to existing run {}", key, existing.run_id);
                    return Ok(SubmitOutcome::from(&existing));
                }
                Some(guard)
            }
            None => None,
        };

        let run_id = run_id_for(request.idempotency_key.as_deref());
        let handle = self
            .ledger
            .create(run_id, request.clone())
            .await
            .map_err(|e| ExecError::InternalError(e.to_string()))?;
        info!("Run {} submitted by {}", handle.run_id(), request.principal);

        match self.admit(&handle, &request).await {
            Ok(plan) => {
                let outcome = SubmitOutcome::from(&handle.snapshot());
                self.spawn_run(handle, plan);
                Ok(outcome)
            }
            Err(err) => {
                let internal = matches!(err, ExecError::InternalError(_));
                let record = finish_and_notify(&self.events, handle, Err(err.clone()), &ResourceUsage::default()).await;
                if internal {
                    return Err(err);
                }
                Ok(SubmitOutcome::from(&record))
            }
        }
    }

    /// Fetch, verify and evaluate policy; on success the run is `admitted`
    async fn admit(&self, handle: &RunHandle, request: &RunRequest) -> Result<ExecutionPlan, ExecError> {
        let artifact = self.store.fetch(&request.module).await.map_err(|e| match e {
            ModuleStoreError::Download(_) => ExecError::InternalError(e.to_string()),
            other => ExecError::VerificationFailed(format!("module_unavailable: {}", other)),
        })?;

        let verified = match self
            .verifier
            .verify(&artifact.bytes, &request.module, artifact.sidecar.as_ref())
        {
            Ok(outcome) => outcome,
            Err(e) => {
                handle.set_admission(false, Variant::Stable, None, Some(e.reason().to_string()));
                return Err(ExecError::VerificationFailed(e.reason().to_string()));
            }
        };
        let signer = verified.signer().map(str::to_string);

        let decision = self
            .policy
            .evaluate(request, signer.as_deref(), current_timestamp())
            .await;
        handle.set_admission(
            decision.allow,
            decision.variant,
            decision.signer.clone(),
            Some(decision.reason.clone()),
        );
        if !decision.allow {
            warn!("Run {} denied: {}", handle.run_id(), decision.reason);
            return Err(ExecError::PolicyDenied(decision.reason));
        }

        handle
            .transition(RunState::Admitted)
            .map_err(|e| ExecError::InternalError(e.to_string()))?;
        info!(
            "Run {} admitted ({}, {})",
            handle.run_id(),
            decision.variant,
            decision.reason
        );

        Ok(ExecutionPlan {
            run_id: handle.run_id().to_string(),
            principal: request.principal.clone(),
            module_bytes: artifact.bytes,
            entry: request.entry().clone(),
            args: request.args.clone(),
            limits: decision.limits,
            grant: decision.grant,
        })
    }

    fn spawn_run(&self, handle: RunHandle, plan: ExecutionPlan) {
        let runtime = Arc::clone(&self.runtime);
        let events = Arc::clone(&self.events);
        let permits = Arc::clone(&self.permits);
        let cancel = self.shutdown.child_token();
        let dry_run = self.config.dry_run;

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let err = ExecError::InternalError("executor shut down".to_string());
                    finish_and_notify(&events, handle, Err(err), &ResourceUsage::default()).await;
                    return;
                }
            };

            if dry_run {
                info!("Run {} finished as dry run", handle.run_id());
                finish_and_notify(&events, handle, Ok(Vec::new()), &ResourceUsage::default()).await;
                return;
            }

            if let Err(e) = handle.transition(RunState::Running) {
                error!("Run {} could not start: {}", handle.run_id(), e);
                return;
            }
            let snapshot = handle.snapshot();
            events
                .publish_lifecycle(LifecycleEvent::Started, &snapshot.run_id, &snapshot.request.principal, &snapshot.view())
                .await;

            let (usage_tx, mut usage_rx) = watch::channel(ResourceUsage::default());
            let execution = runtime.execute(plan, cancel, Some(usage_tx));
            tokio::pin!(execution);
            let mut usage_open = true;
            let report = loop {
                tokio::select! {
                    report = &mut execution => break report,
                    changed = usage_rx.changed(), if usage_open => match changed {
                        Ok(()) => handle.publish_usage(&usage_rx.borrow_and_update()),
                        // sender dropped with the store; the report carries the final usage
                        Err(_) => usage_open = false,
                    },
                }
            };
            finish_and_notify(&events, handle, report.outcome, &report.usage).await;
        });
    }

    pub async fn get(&self, run_id: &str) -> Option<RunView> {
        self.ledger.get(run_id).await.map(|record| record.view())
    }

    /// Wait for a run to reach a terminal state
    pub async fn wait(&self, run_id: &str) -> Option<RunView> {
        self.ledger
            .wait_for_terminal(run_id)
            .await
            .map(|record| record.view())
    }

    /// Cancel in-flight runs; they end as `timeout`
    pub fn shutdown(&self) {
        info!("Cancelling in-flight runs");
        self.permits.close();
        self.shutdown.cancel();
    }
}

async fn finish_and_notify(
    events: &EventPublisher,
    handle: RunHandle,
    outcome: Result<Vec<TypedValue>, ExecError>,
    usage: &ResourceUsage,
) -> RunRecord {
    let fallback = handle.snapshot();
    let record = match handle.finish(outcome, usage) {
        Ok(record) => record,
        Err(e) => {
            error!("Run {} could not be finalized: {}", fallback.run_id, e);
            return fallback;
        }
    };
    let kind = match record.state {
        RunState::Finished => LifecycleEvent::Finished,
        _ => LifecycleEvent::Error,
    };
    info!("Run {} is {}", record.run_id, record.state);
    events
        .publish_lifecycle(kind, &record.run_id, &record.request.principal, &record.view())
        .await;
    record
}
