//! Admission policy
//!
//! Rules are evaluated in a fixed order and the first failing rule decides:
//! kill switch, freeze (fail open with minimal capabilities), then, under the
//! variant picked by the canary controller, capabilities, resource ceilings,
//! http hosts, module allowlist and the optional external decision.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExecConfig, RuleSet};
use crate::module::security::canary::{CanaryController, Variant};
use crate::module::security::decision::{DecisionClient, DecisionInput};
use crate::module::security::permissions::{host_allowed, CapabilityGrant, CapabilityKind};
use crate::module::traits::{ResourceLimits, RunRequest};
use crate::utils::with_millis_timeout;

/// Outcome of policy evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    /// Matched rule
    pub reason: String,
    pub grant: CapabilityGrant,
    pub limits: ResourceLimits,
    pub variant: Variant,
    pub signer: Option<String>,
}

/// Check a module name against allowlist patterns (`*` suffix = prefix match)
pub fn module_allowed(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    })
}

/// Evaluates run requests against configuration
pub struct PolicyEngine {
    config: Arc<ExecConfig>,
    canary: CanaryController,
    decision: Option<Arc<dyn DecisionClient>>,
}

impl PolicyEngine {
    pub fn new(config: Arc<ExecConfig>) -> Self {
        let canary = CanaryController::new(&config.policy.canary);
        Self {
            config,
            canary,
            decision: None,
        }
    }

    /// Attach an external decision client
    pub fn with_decision_client(mut self, client: Arc<dyn DecisionClient>) -> Self {
        self.decision = Some(client);
        self
    }

    pub fn canary(&self) -> &CanaryController {
        &self.canary
    }

    fn rules_for(&self, variant: Variant) -> &RuleSet {
        match variant {
            Variant::Canary => self
                .config
                .policy
                .canary
                .rules
                .as_ref()
                .unwrap_or(&self.config.policy.rules),
            Variant::Stable => &self.config.policy.rules,
        }
    }

    /// Requested ceilings, unset ones defaulting to the maxima
    fn resolve_limits(&self, request: &RunRequest) -> ResourceLimits {
        let max = &self.config.limits;
        ResourceLimits {
            memory_pages: request.limits.memory_pages.unwrap_or(max.max_memory_pages),
            cpu_ms: request.limits.cpu_ms.unwrap_or(max.max_cpu_ms),
            wall_ms: request.limits.wall_ms.unwrap_or(max.max_wall_ms),
        }
    }

    fn decision(
        &self,
        allow: bool,
        reason: impl Into<String>,
        grant: CapabilityGrant,
        limits: ResourceLimits,
        variant: Variant,
        signer: Option<&str>,
    ) -> PolicyDecision {
        PolicyDecision {
            allow,
            reason: reason.into(),
            grant,
            limits,
            variant,
            signer: signer.map(str::to_string),
        }
    }

    fn deny(
        &self,
        reason: impl Into<String>,
        limits: ResourceLimits,
        variant: Variant,
        signer: Option<&str>,
    ) -> PolicyDecision {
        let reason = reason.into();
        warn!("Policy denied run: {}", reason);
        let grant = CapabilityGrant::none(&self.config.capabilities);
        self.decision(false, reason, grant, limits, variant, signer)
    }

    /// Evaluate a request. `signer` is the verified signer identity, if any;
    /// `now_secs` feeds canary bucketing for requests without an idempotency key.
    pub async fn evaluate(
        &self,
        request: &RunRequest,
        signer: Option<&str>,
        now_secs: u64,
    ) -> PolicyDecision {
        let policy = &self.config.policy;
        let max = &self.config.limits;
        let limits = self.resolve_limits(request);

        // (a) kill switch
        if !policy.enabled {
            return self.deny("service_disabled", limits, Variant::Stable, signer);
        }

        // (b) freeze: minimal capabilities, every other check skipped
        if policy.freeze {
            let kinds = request
                .capabilities
                .iter()
                .copied()
                .filter(|k| policy.freeze_capabilities.contains(k));
            let grant = CapabilityGrant::new(kinds, &self.config.capabilities, Vec::new());
            let clamped = ResourceLimits {
                memory_pages: limits.memory_pages.min(max.max_memory_pages),
                cpu_ms: limits.cpu_ms.min(max.max_cpu_ms),
                wall_ms: limits.wall_ms.min(max.max_wall_ms),
            };
            info!("Policy freeze active, admitting with {:?}", grant.kinds());
            return self.decision(true, "freeze_fail_open", grant, clamped, Variant::Stable, signer);
        }

        let variant = self.canary.route(
            request.idempotency_key.as_deref(),
            &request.principal,
            now_secs,
        );
        let rules = self.rules_for(variant);
        debug!("Evaluating run under {} rules", variant);

        // (c) capabilities
        if let Some(kind) = request
            .capabilities
            .iter()
            .find(|k| !rules.allowed_capabilities.contains(k))
        {
            return self.deny(format!("capability_not_allowed:{}", kind), limits, variant, signer);
        }

        // (d) resource ceilings
        if limits.memory_pages > max.max_memory_pages {
            return self.deny("resource_ceiling_exceeded:memory", limits, variant, signer);
        }
        if limits.cpu_ms > max.max_cpu_ms {
            return self.deny("resource_ceiling_exceeded:cpu", limits, variant, signer);
        }
        if limits.wall_ms > max.max_wall_ms {
            return self.deny("resource_ceiling_exceeded:wall", limits, variant, signer);
        }

        // (e) http hosts
        let wants_http = request.capabilities.contains(&CapabilityKind::Http);
        if wants_http {
            if let Some(host) = request
                .limits
                .http_hosts
                .iter()
                .find(|h| !host_allowed(&rules.allowed_http_hosts, h))
            {
                return self.deny(format!("http_host_not_allowed:{}", host), limits, variant, signer);
            }
        }

        // module allowlist
        if !rules.allowed_modules.is_empty() {
            let allowed = request
                .module
                .name
                .as_deref()
                .map(|name| module_allowed(&rules.allowed_modules, name))
                .unwrap_or(false);
            if !allowed {
                return self.deny("module_not_allowed", limits, variant, signer);
            }
        }

        let hosts = if !wants_http {
            Vec::new()
        } else if request.limits.http_hosts.is_empty() {
            rules.allowed_http_hosts.clone()
        } else {
            request.limits.http_hosts.clone()
        };
        let grant = CapabilityGrant::new(
            request.capabilities.iter().copied(),
            &self.config.capabilities,
            hosts,
        );

        // (f) external decision
        if let (Some(client), Some(service)) = (&self.decision, &policy.decision) {
            let input = DecisionInput {
                module: request
                    .module
                    .name
                    .clone()
                    .unwrap_or_else(|| request.module.sha256.clone()),
                sha256: request.module.sha256.clone(),
                caps: grant.kinds(),
                limits,
                principal: request.principal.clone(),
                signer: signer.map(str::to_string),
                variant,
                labels: request.labels.clone(),
            };
            match with_millis_timeout(client.decide(&input), service.timeout_ms).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    return self.deny("decision_denied", limits, variant, signer);
                }
                Ok(Err(e)) => {
                    warn!("Decision service error: {}", e);
                    if !service.default_allow {
                        return self.deny("decision_unavailable", limits, variant, signer);
                    }
                    return self.decision(true, "decision_default_allow", grant, limits, variant, signer);
                }
                Err(_) => {
                    warn!("Decision service timed out after {}ms", service.timeout_ms);
                    if !service.default_allow {
                        return self.deny("decision_unavailable", limits, variant, signer);
                    }
                    return self.decision(true, "decision_default_allow", grant, limits, variant, signer);
                }
            }
        }

        self.decision(true, "allowed", grant, limits, variant, signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionServiceConfig;
    use crate::module::security::decision::DecisionError;
    use crate::module::traits::{EntrySignature, ModuleReference};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(caps: &[CapabilityKind]) -> RunRequest {
        let entry: EntrySignature = "run()".parse().unwrap();
        let mut module = ModuleReference::new("a".repeat(64), entry);
        module.name = Some("wasm/ci/build".to_string());
        let mut req = RunRequest::new(module, "alice");
        req.capabilities = caps.to_vec();
        req
    }

    fn engine(mutate: impl FnOnce(&mut ExecConfig)) -> PolicyEngine {
        let mut config = ExecConfig::default();
        mutate(&mut config);
        PolicyEngine::new(Arc::new(config))
    }

    struct FixedDecision {
        answer: Result<bool, ()>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DecisionClient for FixedDecision {
        async fn decide(&self, _input: &DecisionInput) -> Result<bool, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer.map_err(|_| DecisionError::MissingResult)
        }
    }

    fn fixed(answer: Result<bool, ()>, delay: Duration) -> Arc<FixedDecision> {
        Arc::new(FixedDecision {
            answer,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_kill_switch() {
        let engine = engine(|c| c.policy.enabled = false);
        let decision = engine.evaluate(&request(&[CapabilityKind::Emit]), None, 0).await;
        assert!(!decision.allow);
        assert_eq!(decision.reason, "service_disabled");
        assert!(decision.grant.is_empty());
    }

    #[tokio::test]
    async fn test_freeze_fails_open_with_minimal_capabilities() {
        let engine = engine(|c| {
            c.policy.freeze = true;
            c.policy.rules.allowed_capabilities = vec![];
            c.policy.rules.allowed_modules = vec!["other/*".to_string()];
        });
        let mut req = request(&[CapabilityKind::Emit, CapabilityKind::Http]);
        req.limits.wall_ms = Some(999_999);
        let decision = engine.evaluate(&req, None, 0).await;
        assert!(decision.allow);
        assert_eq!(decision.reason, "freeze_fail_open");
        assert_eq!(decision.grant.kinds(), vec![CapabilityKind::Emit]);
        assert_eq!(decision.limits.wall_ms, 2000);
    }

    #[tokio::test]
    async fn test_capability_outside_allowlist_denied() {
        let engine = engine(|_| {});
        let decision = engine
            .evaluate(&request(&[CapabilityKind::Emit, CapabilityKind::Kv]), None, 0)
            .await;
        assert!(!decision.allow);
        assert_eq!(decision.reason, "capability_not_allowed:kv");
    }

    #[tokio::test]
    async fn test_resource_ceiling_denied_and_defaults() {
        let engine = engine(|_| {});
        let mut req = request(&[CapabilityKind::Emit]);
        req.limits.memory_pages = Some(4096);
        let decision = engine.evaluate(&req, None, 0).await;
        assert_eq!(decision.reason, "resource_ceiling_exceeded:memory");

        let decision = engine.evaluate(&request(&[]), None, 0).await;
        assert!(decision.allow);
        assert_eq!(decision.limits.memory_pages, 2048);
        assert_eq!(decision.limits.cpu_ms, 2000);
    }

    #[tokio::test]
    async fn test_http_hosts() {
        let engine = engine(|c| {
            c.policy.rules.allowed_capabilities = vec![CapabilityKind::Http];
        });
        let mut req = request(&[CapabilityKind::Http]);
        req.limits.http_hosts = vec!["example.com".to_string()];
        let decision = engine.evaluate(&req, None, 0).await;
        assert_eq!(decision.reason, "http_host_not_allowed:example.com");

        req.limits.http_hosts = vec!["relay".to_string()];
        let decision = engine.evaluate(&req, None, 0).await;
        assert!(decision.allow);
        assert!(decision.grant.http_host_allowed("relay"));
        assert!(!decision.grant.http_host_allowed("localhost"));

        req.limits.http_hosts.clear();
        let decision = engine.evaluate(&req, None, 0).await;
        assert!(decision.grant.http_host_allowed("localhost"));
    }

    #[tokio::test]
    async fn test_module_allowlist() {
        assert!(module_allowed(&["wasm/ci/*".to_string()], "wasm/ci/build"));
        assert!(!module_allowed(&["wasm/ci/*".to_string()], "wasm/pulse/x"));
        assert!(module_allowed(&["exact".to_string()], "exact"));

        let engine = engine(|c| c.policy.rules.allowed_modules = vec!["wasm/pulse/*".to_string()]);
        let decision = engine.evaluate(&request(&[]), None, 0).await;
        assert_eq!(decision.reason, "module_not_allowed");
    }

    #[tokio::test]
    async fn test_canary_rules_govern_canary_traffic() {
        let engine = engine(|c| {
            c.policy.canary.fraction = 1.0;
            let mut rules = RuleSet::default();
            rules.allowed_capabilities = vec![CapabilityKind::Emit, CapabilityKind::Kv];
            c.policy.canary.rules = Some(rules);
        });
        let decision = engine
            .evaluate(&request(&[CapabilityKind::Kv]), None, 0)
            .await;
        assert!(decision.allow);
        assert_eq!(decision.variant, Variant::Canary);
    }

    #[tokio::test]
    async fn test_decision_service_outcomes() {
        let with_service = |default_allow: bool| {
            engine(move |c| {
                c.policy.decision = Some(DecisionServiceConfig {
                    url: "http://opa.local/v1/data/void/allow".to_string(),
                    timeout_ms: 20,
                    default_allow,
                })
            })
        };

        let deny = fixed(Ok(false), Duration::ZERO);
        let engine_deny = with_service(false).with_decision_client(deny.clone());
        let decision = engine_deny.evaluate(&request(&[]), None, 0).await;
        assert_eq!(decision.reason, "decision_denied");
        assert_eq!(deny.calls.load(Ordering::SeqCst), 1);

        let slow = fixed(Ok(true), Duration::from_millis(500));
        let engine_slow = with_service(false).with_decision_client(slow);
        let decision = engine_slow.evaluate(&request(&[]), None, 0).await;
        assert_eq!(decision.reason, "decision_unavailable");

        let broken = fixed(Err(()), Duration::ZERO);
        let engine_open = with_service(true).with_decision_client(broken);
        let decision = engine_open.evaluate(&request(&[]), None, 0).await;
        assert!(decision.allow);
        assert_eq!(decision.reason, "decision_default_allow");
    }

    #[tokio::test]
    async fn test_decision_service_skipped_on_earlier_deny() {
        let client = fixed(Ok(true), Duration::ZERO);
        let engine = engine(|c| {
            c.policy.decision = Some(DecisionServiceConfig {
                url: "http://opa.local".to_string(),
                timeout_ms: 20,
                default_allow: false,
            })
        })
        .with_decision_client(client.clone());
        let decision = engine
            .evaluate(&request(&[CapabilityKind::Http]), None, 0)
            .await;
        assert!(!decision.allow);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
