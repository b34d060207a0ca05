//! The evaluate-access call
//!
//! aggregate context -> score risk -> evaluate policies -> audit -> respond.
//!
//! The audit write happens before the decision is handed back. If it fails
//! the caller gets `AuditWriteFailed` and no decision at all. Retries that
//! reuse a request id within the idempotency window get the original
//! decision back without a second audit record. A different request under a
//! reused id is refused with `RequestIdConflict`.

use crate::audit::{AuditRecord, AuditSink};
use crate::config::{EngineConfig, IdempotencyConfig};
use crate::context::{AccessRequest, ContextAggregator};
use crate::error::{EngineError, Result};
use crate::evaluator::{Decision, PolicyEngine};
use crate::metrics::{DecisionMetrics, EngineStatus};
use crate::policy::PolicyStore;
use crate::risk::RiskEngine;
use crate::session::SessionManager;
use crate::threat::{spawn_refresher, ThreatFeed, ThreatIntelStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The parts of a request a replayed decision must agree with
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestFingerprint {
    principal_id: String,
    resource_id: String,
    action: String,
    device_id: Option<String>,
    origin: Option<String>,
}

impl RequestFingerprint {
    fn of(request: &AccessRequest) -> Self {
        Self {
            principal_id: request.principal_id.clone(),
            resource_id: request.resource_id.clone(),
            action: request.action.clone(),
            device_id: request.device_id.clone(),
            origin: request.origin.clone(),
        }
    }
}

struct IdempotencyEntry {
    created: Instant,
    fingerprint: RequestFingerprint,
    decision: Arc<OnceCell<Decision>>,
}

impl IdempotencyEntry {
    fn new(request: &AccessRequest) -> Self {
        Self {
            created: Instant::now(),
            fingerprint: RequestFingerprint::of(request),
            decision: Arc::new(OnceCell::new()),
        }
    }
}

/// Access decision engine
pub struct AccessEngine {
    aggregator: ContextAggregator,
    risk: RiskEngine,
    policies: PolicyEngine,
    threats: Arc<ThreatIntelStore>,
    audit: Arc<dyn AuditSink>,
    sessions: Arc<SessionManager>,
    metrics: DecisionMetrics,
    idempotency: IdempotencyConfig,
    recent: DashMap<String, IdempotencyEntry>,
    config: EngineConfig,
}

impl AccessEngine {
    pub fn new(
        aggregator: ContextAggregator,
        policies: Arc<PolicyStore>,
        threats: Arc<ThreatIntelStore>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            aggregator,
            risk: RiskEngine::new(config.risk.clone()),
            policies: PolicyEngine::new(policies),
            threats,
            audit,
            sessions: Arc::new(SessionManager::new(config.monitor.clone())),
            metrics: DecisionMetrics::new(),
            idempotency: config.idempotency.clone(),
            recent: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        self.policies.store()
    }

    pub fn threats(&self) -> &Arc<ThreatIntelStore> {
        &self.threats
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn metrics(&self) -> &DecisionMetrics {
        &self.metrics
    }

    /// Decide one request.
    ///
    /// Concurrent calls with the same request id share a single evaluation.
    /// Failed evaluations are not remembered, so a retry re-evaluates. A
    /// request whose principal, resource, action, device or origin differs
    /// from the one first seen under its id gets `RequestIdConflict`.
    pub async fn evaluate_access(&self, request: &AccessRequest) -> Result<Decision> {
        self.prune_expired();

        let cell = {
            let mut entry = self
                .recent
                .entry(request.request_id.clone())
                .or_insert_with(|| IdempotencyEntry::new(request));
            if entry.created.elapsed() >= self.idempotency_window() {
                *entry = IdempotencyEntry::new(request);
            } else if entry.fingerprint != RequestFingerprint::of(request) {
                warn!(
                    request_id = %request.request_id,
                    principal = %request.principal_id,
                    "request id reused for a different request"
                );
                return Err(EngineError::RequestIdConflict(request.request_id.clone()));
            }
            entry.decision.clone()
        };

        if let Some(decision) = cell.get() {
            debug!(request_id = %request.request_id, "replaying decision for retried request");
            return Ok(decision.clone());
        }

        match cell.get_or_try_init(|| self.decide_and_record(request, None)).await {
            Ok(decision) => Ok(decision.clone()),
            Err(e) => {
                self.recent
                    .remove_if(&request.request_id, |_, entry| !entry.decision.initialized());
                Err(e)
            }
        }
    }

    /// Re-run the pipeline for a live session. Never cached.
    pub async fn reassess(&self, request: &AccessRequest, session_id: &str) -> Result<Decision> {
        self.decide_and_record(request, Some(session_id)).await
    }

    /// Keep the threat store fed from `feed` at the configured interval
    pub fn spawn_threat_refresh(&self, feed: Arc<dyn ThreatFeed>) -> JoinHandle<()> {
        spawn_refresher(
            self.threats.clone(),
            feed,
            self.config.threats.refresh_interval(),
        )
    }

    pub fn status(&self) -> EngineStatus {
        let policies = self.policies.store().snapshot();
        let threats = self.threats.current_snapshot();
        EngineStatus {
            health: self.metrics.health(),
            policy_version: policies.version(),
            policy_count: policies.len(),
            threat_epoch: threats.epoch(),
            threat_indicators: threats.len(),
            active_sessions: self.sessions.active_count(),
            metrics: self.metrics.snapshot(),
        }
    }

    async fn decide_and_record(
        &self,
        request: &AccessRequest,
        session_id: Option<&str>,
    ) -> Result<Decision> {
        let started = Instant::now();

        let context = self.aggregator.aggregate(request).await;
        let threats = self.threats.current_snapshot();
        let risk = self.risk.score(&context, &threats);
        let decision = self.policies.evaluate(request, &context, &risk);

        let mut record = AuditRecord::new(&decision, &context, &risk);
        if let Some(id) = session_id {
            record = record.for_session(id);
        }

        if let Err(e) = self.audit.append(&record).await {
            self.metrics.record_audit_failure();
            error!(request_id = %request.request_id, "decision withheld: {}", e);
            return Err(EngineError::AuditWriteFailed(e.to_string()));
        }

        self.metrics
            .record(decision.effect, decision.degraded, started.elapsed());
        Ok(decision)
    }

    fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency.window_secs)
    }

    fn prune_expired(&self) {
        if self.recent.len() < self.idempotency.capacity {
            return;
        }
        let window = self.idempotency_window();
        self.recent.retain(|_, entry| entry.created.elapsed() < window);
    }
}
