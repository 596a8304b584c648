//! Syscall gateway
//!
//! Every side effect a module attempts arrives here. A request is answered
//! with exactly one response; rejections are non-fatal `denied` responses and
//! the run continues. Every decision is counted on the run's usage.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::module::api::events::EventPublisher;
use crate::module::api::http::{url_host, FetchRequest, HttpFetcher};
use crate::module::api::kv::KvStore;
use crate::module::api::rate_limit::SyscallRateLimiter;
use crate::module::ipc::protocol::{
    decode_batch, encode_batch, ProtocolError, SyscallRequest, SyscallResponse,
};
use crate::module::security::permissions::{CapabilityGrant, CapabilityKind};
use crate::module::traits::{ExecError, ResourceUsage};

/// Per-run gateway state: identity, grant and counters
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub run_id: String,
    pub principal: String,
    pub grant: CapabilityGrant,
    pub usage: ResourceUsage,
    /// Most recent rejection, kept for diagnostics
    pub last_rejection: Option<ExecError>,
    /// Cancelled when the run must stop; pending requests are abandoned
    pub cancel: CancellationToken,
    /// Wall-clock end of the run; outbound timeouts never reach past it
    pub deadline: Option<Instant>,
}

impl GatewaySession {
    pub fn new(run_id: impl Into<String>, principal: impl Into<String>, grant: CapabilityGrant) -> Self {
        Self {
            run_id: run_id.into(),
            principal: principal.into(),
            grant,
            usage: ResourceUsage::default(),
            last_rejection: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Bind the session to the run's cancellation token and wall deadline
    pub fn with_deadline(mut self, cancel: CancellationToken, deadline: Instant) -> Self {
        self.cancel = cancel;
        self.deadline = Some(deadline);
        self
    }

    /// Wall time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn reject(&mut self, capability: CapabilityKind, reason: &str) -> ExecError {
        let err = ExecError::GatewayRejected {
            capability,
            reason: reason.to_string(),
        };
        self.usage.record_syscall(capability, false);
        self.last_rejection = Some(err.clone());
        err
    }
}

/// Mediates syscalls against per-run capability grants
pub struct SyscallGateway {
    rate_limiter: SyscallRateLimiter,
    kv: Arc<KvStore>,
    fetcher: Arc<dyn HttpFetcher>,
    events: Arc<EventPublisher>,
}

impl SyscallGateway {
    pub fn new(kv: Arc<KvStore>, fetcher: Arc<dyn HttpFetcher>, events: Arc<EventPublisher>) -> Self {
        Self {
            rate_limiter: SyscallRateLimiter::new(),
            kv,
            fetcher,
            events,
        }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    /// Handle a newline-delimited batch and return the encoded responses.
    ///
    /// Once the session is cancelled the remaining requests are answered
    /// with `error` / `cancelled` without being performed.
    pub async fn handle_batch(&self, session: &mut GatewaySession, payload: &[u8]) -> Vec<u8> {
        let mut responses = Vec::new();
        for decoded in decode_batch(payload) {
            let response = if session.cancel.is_cancelled() {
                SyscallResponse::error(decoded.as_ref().ok(), "cancelled")
            } else {
                match decoded {
                    Ok(request) => self.handle(session, &request).await,
                    Err(err) => {
                        session.usage.malformed += 1;
                        debug!("Run {} sent malformed syscall: {}", session.run_id, err);
                        let reason = match err {
                            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
                            ProtocolError::InvalidUtf8 | ProtocolError::Malformed(_) => "malformed_request",
                        };
                        SyscallResponse::error(None, reason)
                    }
                }
            };
            responses.push(response);
        }
        encode_batch(&responses)
    }

    /// Handle one request
    ///
    /// Order: grant, static limits (payload size, host allowlist), rate
    /// limit, then the side effect. A request refused by a static rule does
    /// not spend a rate-limit token.
    pub async fn handle(&self, session: &mut GatewaySession, request: &SyscallRequest) -> SyscallResponse {
        let kind = request.kind();

        if !session.grant.has(kind) {
            let err = session.reject(kind, "capability_not_granted");
            warn!("Run {}: {}", session.run_id, err);
            return SyscallResponse::denied(request, "capability_not_granted");
        }

        if let Some(reason) = static_rejection(session, request) {
            session.reject(kind, reason);
            debug!("Run {} {} refused: {}", session.run_id, request.op(), reason);
            return SyscallResponse::denied(request, reason);
        }

        let (burst, rate) = match kind {
            CapabilityKind::Emit => (session.grant.emit.burst, session.grant.emit.rate_per_sec),
            CapabilityKind::Http => (
                session.grant.http.limits.burst,
                session.grant.http.limits.rate_per_sec,
            ),
            CapabilityKind::Kv => (session.grant.kv.burst, session.grant.kv.rate_per_sec),
        };
        if !self
            .rate_limiter
            .check(&session.principal, kind, burst, rate)
            .await
        {
            let err = session.reject(kind, "rate_limited");
            warn!("Run {}: {}", session.run_id, err);
            return SyscallResponse::denied(request, "rate_limited");
        }

        match request {
            SyscallRequest::Emit { event } => {
                session.usage.record_syscall(kind, true);
                match self
                    .events
                    .publish_module_event(&session.run_id, &session.principal, event.clone())
                    .await
                {
                    Ok(()) => SyscallResponse::success(request),
                    Err(e) => {
                        warn!("Run {} emit delivery failed: {}", session.run_id, e);
                        SyscallResponse::error(Some(request), "emit_failed")
                    }
                }
            }

            SyscallRequest::HttpFetch { req, limits, .. } => {
                session.usage.record_syscall(kind, true);

                let grant_limits = &session.grant.http.limits;
                let max_bytes = limits
                    .byte_cap()
                    .map_or(grant_limits.max_response_bytes, |cap| {
                        cap.min(grant_limits.max_response_bytes)
                    });
                let timeout_ms = limits
                    .timeout_ms
                    .map_or(grant_limits.timeout_ms, |t| t.min(grant_limits.timeout_ms));
                let mut timeout = Duration::from_millis(timeout_ms);
                if let Some(remaining) = session.remaining() {
                    timeout = timeout.min(remaining);
                }
                let fetch = FetchRequest {
                    method: req.method.clone(),
                    url: req.url.clone(),
                    headers: req.headers.clone(),
                    body: req.body.clone(),
                    max_bytes,
                    timeout,
                };
                let fetched = tokio::select! {
                    fetched = self.fetcher.fetch(fetch) => Some(fetched),
                    _ = session.cancel.cancelled() => None,
                };
                match fetched {
                    Some(Ok(outcome)) => {
                        SyscallResponse::http(request, outcome.status, outcome.bytes, outcome.truncated)
                    }
                    Some(Err(e)) => {
                        warn!("Run {} fetch failed: {}", session.run_id, e);
                        SyscallResponse::error(Some(request), "fetch_failed")
                    }
                    None => {
                        debug!("Run {} fetch abandoned on cancellation", session.run_id);
                        SyscallResponse::error(Some(request), "cancelled")
                    }
                }
            }

            SyscallRequest::KvGet { ns, key } => {
                session.usage.record_syscall(kind, true);
                let ns = ns.as_deref().unwrap_or(&session.principal);
                let value = self.kv.get(ns, key).await;
                SyscallResponse::kv_value(request, key, value)
            }

            SyscallRequest::KvSet { ns, key, value } => {
                let ns = ns.clone().unwrap_or_else(|| session.principal.clone());
                let limits = &session.grant.kv;
                match self
                    .kv
                    .set(&ns, key, value.clone(), limits.max_keys, limits.max_value_bytes)
                    .await
                {
                    Ok(()) => {
                        session.usage.record_syscall(kind, true);
                        SyscallResponse::success(request)
                    }
                    Err(e) => {
                        session.reject(kind, e.reason());
                        debug!("Run {} kv.set refused: {}", session.run_id, e);
                        SyscallResponse::denied(request, e.reason())
                    }
                }
            }
        }
    }
}

/// Rules that depend only on the request and the grant
fn static_rejection(session: &GatewaySession, request: &SyscallRequest) -> Option<&'static str> {
    match request {
        SyscallRequest::Emit { event } => {
            let size = serde_json::to_vec(event).map(|v| v.len()).unwrap_or(usize::MAX);
            (size > session.grant.emit.max_payload_bytes).then_some("payload_too_large")
        }
        SyscallRequest::HttpFetch { req, .. } => match url_host(&req.url) {
            None => Some("invalid_url"),
            Some(host) if !session.grant.http_host_allowed(&host) => Some("http_host_not_allowed"),
            Some(_) => None,
        },
        SyscallRequest::KvGet { .. } | SyscallRequest::KvSet { .. } => None,
    }
}
