//! Continuous authentication
//!
//! One background task per watched session. Each task re-evaluates its
//! session on a fixed interval, immediately when a new threat snapshot
//! flags the session's principal or device, and when asked to. A session
//! whose fresh outcome falls below its trust level is moved to Degraded.
//!
//! The task is the session's only re-evaluator, so its results land in the
//! order they were produced. The session lock is never held while sources
//! are queried or policies evaluated.

use crate::engine::AccessEngine;
use crate::error::{EngineError, Result};
use crate::session::{outcome_below_trust, Session, SessionEvent, SessionState};
use crate::threat::ThreatIndicators;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What one re-evaluation cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Outcome still within the session's trust
    Unchanged,
    /// Session moved to Degraded
    Downgraded,
    /// Session is not in a monitored state right now
    Skipped,
    /// Session ended; the task stops
    Finished,
}

struct Watch {
    task: JoinHandle<()>,
    trigger: Arc<Notify>,
}

/// Owns the per-session re-evaluation tasks
pub struct ContinuousAuthMonitor {
    engine: Arc<AccessEngine>,
    watches: DashMap<String, Watch>,
}

impl ContinuousAuthMonitor {
    pub fn new(engine: Arc<AccessEngine>) -> Self {
        Self {
            engine,
            watches: DashMap::new(),
        }
    }

    /// Start monitoring a session. Watching an already watched session is a
    /// no-op.
    pub fn watch(&self, session_id: &str) -> Result<()> {
        let handle = self
            .engine
            .sessions()
            .handle(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        self.watches.retain(|_, w| !w.task.is_finished());
        if self.watches.contains_key(session_id) {
            return Ok(());
        }

        let trigger = Arc::new(Notify::new());
        let threats = self.engine.threats().subscribe();
        let task = tokio::spawn(run(
            self.engine.clone(),
            session_id.to_string(),
            handle,
            trigger.clone(),
            threats,
        ));
        self.watches
            .insert(session_id.to_string(), Watch { task, trigger });
        debug!(session_id, "monitoring session");
        Ok(())
    }

    /// Ask a session's task to re-evaluate now. Returns false if the session
    /// is not being watched.
    pub fn reevaluate_now(&self, session_id: &str) -> bool {
        match self.watches.get(session_id) {
            Some(watch) if !watch.task.is_finished() => {
                watch.trigger.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Number of sessions with a live task
    pub fn watched(&self) -> usize {
        self.watches
            .iter()
            .filter(|w| !w.value().task.is_finished())
            .count()
    }

    /// Terminate every expired session, watched or not, and stop the tasks
    /// of those that were watched. Returns how many sessions ended.
    pub async fn sweep(&self) -> usize {
        let expired = self.engine.sessions().sweep_expired(Utc::now()).await;
        for (id, cause) in &expired {
            if let Some((_, watch)) = self.watches.remove(id) {
                watch.task.abort();
            }
            info!(session_id = %id, %cause, "expired session swept");
        }
        expired.len()
    }

    /// Stop every task. Sessions keep whatever state they had.
    pub fn shutdown(&self) {
        for entry in self.watches.iter() {
            entry.value().task.abort();
        }
        self.watches.clear();
    }
}

impl Drop for ContinuousAuthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(
    engine: Arc<AccessEngine>,
    session_id: String,
    handle: Arc<Mutex<Session>>,
    trigger: Arc<Notify>,
    mut threats: watch::Receiver<Arc<ThreatIndicators>>,
) {
    let period = engine.config().monitor.reevaluation_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
            changed = threats.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = threats.borrow_and_update().clone();
                let (principal, device) = {
                    let session = handle.lock().await;
                    (session.principal_id.clone(), session.device_id.clone())
                };
                if !snapshot.intersects(&principal, device.as_deref()) {
                    continue;
                }
                info!(
                    session_id = %session_id,
                    epoch = snapshot.epoch(),
                    "threat snapshot flags session"
                );
            }
        }

        match reevaluate(&engine, &session_id, &handle).await {
            Ok(CycleOutcome::Finished) => return,
            Ok(outcome) => debug!(session_id = %session_id, ?outcome, "re-evaluation done"),
            Err(e) => error!(session_id = %session_id, "re-evaluation failed: {}", e),
        }
    }
}

/// One re-evaluation cycle for a session
pub async fn reevaluate(
    engine: &AccessEngine,
    session_id: &str,
    handle: &Mutex<Session>,
) -> Result<CycleOutcome> {
    let monitor = &engine.config().monitor;
    let now = Utc::now();

    let (request, generation, expired) = {
        let mut session = handle.lock().await;
        if session.is_terminated() {
            return Ok(CycleOutcome::Finished);
        }
        let expired = session.expiry(now, monitor.idle_timeout(), monitor.max_lifetime());
        if expired.is_none() && !session.state.is_monitored() {
            return Ok(CycleOutcome::Skipped);
        }
        let request = session.reevaluation_request();
        session.reevaluations += 1;
        (request, session.generation, expired)
    };

    if let Some(cause) = expired {
        // Someone else may have ended it in the meantime
        if let Err(e) = engine.sessions().terminate(session_id, cause).await {
            debug!(session_id, "expiry not applied: {}", e);
        }
        return Ok(CycleOutcome::Finished);
    }

    let decision = engine.reassess(&request, session_id).await?;

    let mut session = handle.lock().await;
    if session.is_terminated() {
        debug!(session_id, "session ended during re-evaluation, result dropped");
        return Ok(CycleOutcome::Finished);
    }
    if session.generation != generation {
        debug!(session_id, "session changed during re-evaluation, result dropped");
        return Ok(CycleOutcome::Skipped);
    }
    session.last_reevaluated_at = Some(now);

    if session.state.is_monitored() && outcome_below_trust(&decision, session.trust_level) {
        session.apply(SessionEvent::ReevaluationDowngrade)?;
        session.downgrade_reason = Some(decision.details.clone());
        warn!(
            session_id,
            effect = %decision.effect,
            risk = decision.risk_score,
            "session downgraded"
        );
        return Ok(CycleOutcome::Downgraded);
    }

    if session.state == SessionState::Degraded {
        return Ok(CycleOutcome::Skipped);
    }
    Ok(CycleOutcome::Unchanged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::EngineConfig;
    use crate::context::{AccessRequest, ContextAggregator, NetworkZone};
    use crate::level::Sensitivity;
    use crate::policy::PolicyStore;
    use crate::sources::{FixtureDevice, FixtureIdentity, FixtureSources, SourceKind};
    use crate::threat::ThreatIntelStore;
    use std::time::Duration;

    fn sources() -> FixtureSources {
        FixtureSources::new()
            .with_identity(
                "alice",
                FixtureIdentity {
                    roles: ["staff".to_string()].into_iter().collect(),
                    mfa: true,
                    last_strong_auth_secs: Some(60),
                },
            )
            .with_device(
                "laptop-1",
                FixtureDevice {
                    registered: true,
                    compliant: true,
                    healthy_secs_ago: Some(30),
                },
            )
            .with_network("10.0.0.5", NetworkZone::Trusted)
            .with_resource("wiki", Sensitivity::Internal)
    }

    fn engine(interval_ms: u64) -> (Arc<AccessEngine>, Arc<MemoryAuditSink>) {
        engine_with(sources(), interval_ms)
    }

    fn engine_with(
        sources: FixtureSources,
        interval_ms: u64,
    ) -> (Arc<AccessEngine>, Arc<MemoryAuditSink>) {
        let mut config = EngineConfig::default();
        config.monitor.reevaluation_interval_ms = interval_ms;
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = AccessEngine::new(
            ContextAggregator::from_shared(Arc::new(sources), config.aggregator.clone()),
            Arc::new(PolicyStore::default()),
            Arc::new(ThreatIntelStore::new()),
            audit.clone(),
            config,
        );
        (Arc::new(engine), audit)
    }

    fn request() -> AccessRequest {
        AccessRequest::new("req-1", "alice", "wiki", "read")
            .with_device("laptop-1")
            .with_origin("10.0.0.5")
    }

    async fn wait_for_state(engine: &AccessEngine, id: &str, state: SessionState) -> bool {
        for _ in 0..100 {
            if let Some(session) = engine.sessions().get(id).await {
                if session.state == state {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_healthy_session_unchanged() {
        let (engine, audit) = engine(60_000);
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        let handle = engine.sessions().handle(&session.id).unwrap();

        let outcome = reevaluate(&engine, &session.id, &handle).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Unchanged);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id.as_deref(), Some(session.id.as_str()));
    }

    #[tokio::test]
    async fn test_threat_publication_degrades_session() {
        let (engine, _audit) = engine(60_000);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&session.id).unwrap();

        engine
            .threats()
            .refresh(ThreatIndicators::builder(1).principal("alice").build())
            .unwrap();

        assert!(wait_for_state(&engine, &session.id, SessionState::Degraded).await);
        let degraded = engine.sessions().get(&session.id).await.unwrap();
        assert!(degraded.downgrade_reason.unwrap().contains("deny-threat-indicators"));
    }

    #[tokio::test]
    async fn test_unrelated_threats_ignored() {
        let (engine, audit) = engine(60_000);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&session.id).unwrap();

        engine
            .threats()
            .refresh(ThreatIndicators::builder(1).principal("mallory").build())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(audit.is_empty());
        assert_eq!(
            engine.sessions().get(&session.id).await.unwrap().state,
            SessionState::Authenticated
        );
    }

    #[tokio::test]
    async fn test_periodic_tick_reevaluates() {
        let (engine, audit) = engine(20);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&session.id).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!audit.is_empty());
        assert_eq!(monitor.watched(), 1);
    }

    #[tokio::test]
    async fn test_tick_alone_degrades_session() {
        let (engine, audit) = engine(200);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&session.id).unwrap();

        // Network indicators do not wake the task, so only the tick sees this
        engine
            .threats()
            .refresh(ThreatIndicators::builder(1).network("10.0.0.5").build())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(audit.is_empty());
        assert_eq!(
            engine.sessions().get(&session.id).await.unwrap().state,
            SessionState::Authenticated
        );

        assert!(wait_for_state(&engine, &session.id, SessionState::Degraded).await);
        let degraded = engine.sessions().get(&session.id).await.unwrap();
        assert!(degraded.downgrade_reason.unwrap().contains("deny-threat-indicators"));
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_result_dropped_after_concurrent_transition() {
        let slow = sources().with_latency(SourceKind::Identity, Duration::from_millis(150));
        let (engine, audit) = engine_with(slow, 60_000);
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        let handle = engine.sessions().handle(&session.id).unwrap();
        engine
            .threats()
            .refresh(ThreatIndicators::builder(1).principal("alice").build())
            .unwrap();

        let cycle = {
            let engine = engine.clone();
            let id = session.id.clone();
            let handle = handle.clone();
            tokio::spawn(async move { reevaluate(&engine, &id, &handle).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine
            .sessions()
            .apply(&session.id, SessionEvent::StepUpSucceeded)
            .await
            .unwrap();

        let outcome = cycle.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped);
        assert_eq!(handle.lock().await.state, SessionState::Elevated);
        // The decision was still audited
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_and_revocation_stop_task() {
        let (engine, audit) = engine(60_000);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&session.id).unwrap();

        assert!(monitor.reevaluate_now(&session.id));
        for _ in 0..100 {
            if !audit.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(audit.len(), 1);

        engine.sessions().revoke(&session.id).await.unwrap();
        monitor.reevaluate_now(&session.id);
        for _ in 0..100 {
            if monitor.watched() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.watched(), 0);
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_terminated_on_cycle() {
        let (engine, audit) = engine(60_000);
        let session = engine.sessions().establish(&request(), true).await.unwrap();
        let handle = engine.sessions().handle(&session.id).unwrap();
        handle.lock().await.last_activity = Utc::now() - chrono::Duration::hours(2);

        let outcome = reevaluate(&engine, &session.id, &handle).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Finished);
        assert!(handle.lock().await.is_terminated());
        assert_eq!(engine.sessions().active_count(), 0);
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_ends_expired_watched_session() {
        let (engine, _) = engine(60_000);
        let monitor = ContinuousAuthMonitor::new(engine.clone());
        let stale = engine.sessions().establish(&request(), true).await.unwrap();
        let fresh = engine.sessions().establish(&request(), true).await.unwrap();
        monitor.watch(&stale.id).unwrap();
        monitor.watch(&fresh.id).unwrap();

        let handle = engine.sessions().handle(&stale.id).unwrap();
        handle.lock().await.created_at = Utc::now() - chrono::Duration::days(2);

        assert_eq!(monitor.sweep().await, 1);
        assert_eq!(monitor.watched(), 1);
        assert!(engine.sessions().get(&stale.id).await.is_none());
        assert_eq!(engine.sessions().active_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_unknown_session() {
        let (engine, _) = engine(60_000);
        let monitor = ContinuousAuthMonitor::new(engine);
        assert!(matches!(
            monitor.watch("ses_missing"),
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
