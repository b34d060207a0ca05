//! End-to-end access decisions against fixture collaborators

use gatekeeper::audit::{AuditLog, AuditQuery};
use gatekeeper::config::EngineConfig;
use gatekeeper::context::{AccessRequest, ContextAggregator, NetworkZone};
use gatekeeper::evaluator::Reason;
use gatekeeper::level::{AssuranceLevel, Sensitivity};
use gatekeeper::policy::{Effect, Policy, PolicySet, PolicyStore, Predicate};
use gatekeeper::session::SessionState;
use gatekeeper::sources::{FixtureDevice, FixtureIdentity, FixtureSources, SourceKind};
use gatekeeper::threat::{ThreatIndicators, ThreatIntelStore};
use gatekeeper::{AccessEngine, AuditSink, ContinuousAuthMonitor, MemoryAuditSink};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

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
            "laptop-alice",
            FixtureDevice {
                registered: true,
                compliant: true,
                healthy_secs_ago: Some(30),
            },
        )
        .with_network("10.0.0.5", NetworkZone::Trusted)
        .with_network("172.16.9.9", NetworkZone::Unknown)
        .with_resource("handbook", Sensitivity::Public)
        .with_resource("wiki", Sensitivity::Internal)
        .with_resource("prod-db", Sensitivity::Restricted)
}

fn build(
    sources: FixtureSources,
    policies: PolicySet,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
) -> Arc<AccessEngine> {
    Arc::new(AccessEngine::new(
        ContextAggregator::from_shared(Arc::new(sources), config.aggregator.clone()),
        Arc::new(PolicyStore::new(policies)),
        Arc::new(ThreatIntelStore::new()),
        audit,
        config,
    ))
}

fn baseline_engine() -> (Arc<AccessEngine>, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = build(
        sources(),
        PolicySet::baseline(),
        audit.clone(),
        EngineConfig::default(),
    );
    (engine, audit)
}

fn alice(id: &str, resource: &str) -> AccessRequest {
    AccessRequest::new(id, "alice", resource, "read")
        .with_device("laptop-alice")
        .with_origin("10.0.0.5")
}

#[tokio::test]
async fn test_healthy_public_request_allowed() {
    let (engine, _) = baseline_engine();

    let decision = engine
        .evaluate_access(&alice("req-1", "handbook"))
        .await
        .unwrap();

    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.reason, Reason::PolicyAllow);
    assert_eq!(decision.matched_policy.as_deref(), Some("allow-public-internal"));
    assert!(decision.risk_score < engine.config().risk.step_up_threshold);
    assert!(!decision.degraded);
}

#[tokio::test]
async fn test_restricted_resource_from_unknown_network_challenged() {
    let (engine, _) = baseline_engine();
    let request = AccessRequest::new("req-2", "alice", "prod-db", "read")
        .with_device("laptop-alice")
        .with_origin("172.16.9.9");

    let decision = engine.evaluate_access(&request).await.unwrap();

    assert_eq!(decision.effect, Effect::Challenge);
    assert!(decision.risk_score >= engine.config().risk.step_up_threshold);
    assert!(decision.required_assurance.unwrap() >= AssuranceLevel::Mfa);
    assert!(!decision.degraded);
}

#[tokio::test]
async fn test_flagged_principal_denied_by_threat_policy() {
    let (engine, _) = baseline_engine();
    engine
        .threats()
        .refresh(ThreatIndicators::builder(1).principal("alice").build())
        .unwrap();

    let decision = engine
        .evaluate_access(&alice("req-3", "handbook"))
        .await
        .unwrap();

    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason, Reason::PolicyDeny);
    assert_eq!(decision.matched_policy.as_deref(), Some("deny-threat-indicators"));
}

#[tokio::test]
async fn test_device_posture_timeout_never_allows() {
    let audit = Arc::new(MemoryAuditSink::new());
    let config = EngineConfig::default();
    let slow = config.aggregator.per_source_timeout() + Duration::from_millis(200);
    let engine = build(
        sources().with_latency(SourceKind::DevicePosture, slow),
        PolicySet::baseline(),
        audit.clone(),
        config,
    );

    let decision = engine
        .evaluate_access(&alice("req-4", "handbook"))
        .await
        .unwrap();

    assert!(decision.degraded);
    assert_ne!(decision.effect, Effect::Allow);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .degraded_sources
        .contains(&SourceKind::DevicePosture));
}

#[tokio::test]
async fn test_session_degraded_after_principal_flagged() {
    let audit = Arc::new(MemoryAuditSink::new());
    let mut config = EngineConfig::default();
    config.monitor.reevaluation_interval_ms = 100;
    let interval = config.monitor.reevaluation_interval();
    let engine = build(sources(), PolicySet::baseline(), audit, config);
    let monitor = ContinuousAuthMonitor::new(engine.clone());

    let session = engine
        .sessions()
        .establish(&alice("req-5", "wiki"), true)
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Authenticated);
    monitor.watch(&session.id).unwrap();

    engine
        .threats()
        .refresh(ThreatIndicators::builder(1).principal("alice").build())
        .unwrap();

    // One interval plus scheduling slack
    let deadline = tokio::time::Instant::now() + interval * 2;
    let mut state = SessionState::Authenticated;
    while tokio::time::Instant::now() < deadline {
        state = engine.sessions().get(&session.id).await.unwrap().state;
        if state == SessionState::Degraded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state, SessionState::Degraded);

    monitor.shutdown();
}

#[tokio::test]
async fn test_challenge_beats_lower_priority_allow() {
    let everything = || Predicate::any().for_resources(["*"]);
    let policies = PolicySet::new(
        7,
        vec![
            Policy::new("challenge-all", 200, Effect::Challenge, everything())
                .requiring(AssuranceLevel::StepUp),
            Policy::new("allow-all", 100, Effect::Allow, everything()),
        ],
    )
    .unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = build(sources(), policies, audit, EngineConfig::default());

    let decision = engine
        .evaluate_access(&alice("req-6", "handbook"))
        .await
        .unwrap();

    assert_eq!(decision.effect, Effect::Challenge);
    assert_eq!(decision.matched_policy.as_deref(), Some("challenge-all"));
    assert_eq!(decision.required_assurance, Some(AssuranceLevel::StepUp));
    assert_eq!(decision.policy_version, 7);
}

#[tokio::test]
async fn test_unmatched_request_denied_by_default() {
    let policies = PolicySet::new(
        2,
        vec![Policy::new(
            "allow-wiki-only",
            10,
            Effect::Allow,
            Predicate::any().for_resources(["wiki"]),
        )],
    )
    .unwrap();
    let engine = build(
        sources(),
        policies,
        Arc::new(MemoryAuditSink::new()),
        EngineConfig::default(),
    );

    let decision = engine
        .evaluate_access(&alice("req-7", "handbook"))
        .await
        .unwrap();
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason, Reason::DefaultDeny);
    assert!(decision.matched_policy.is_none());
}

#[tokio::test]
async fn test_every_decision_written_once_to_log() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(AuditLog::with_path(dir.path().join("audit.jsonl")));
    let engine = build(
        sources(),
        PolicySet::baseline(),
        log.clone(),
        EngineConfig::default(),
    );

    let mut ids = Vec::new();
    for (i, resource) in ["handbook", "wiki", "prod-db", "unknown-thing"].iter().enumerate() {
        let id = format!("req-{}", i);
        engine.evaluate_access(&alice(&id, resource)).await.unwrap();
        // Retry with the same id inside the window
        engine.evaluate_access(&alice(&id, resource)).await.unwrap();
        ids.push(id);
    }

    let records = log.recent(100).unwrap();
    assert_eq!(records.len(), ids.len());
    for id in &ids {
        assert_eq!(records.iter().filter(|r| r.request_id() == id).count(), 1);
    }

    let denied = log
        .query(AuditQuery::default().effect(Effect::Deny))
        .unwrap();
    assert!(denied.iter().all(|r| r.decision.effect == Effect::Deny));
}

#[tokio::test]
async fn test_policy_reload_keeps_previous_set_on_rejection() {
    let (engine, _) = baseline_engine();
    let store = engine.policies().clone();

    // Duplicate priority is not a strict total order
    let rejected = store.install(
        2,
        vec![
            Policy::new("a", 10, Effect::Allow, Predicate::any()),
            Policy::new("b", 10, Effect::Deny, Predicate::any()),
        ],
    );
    assert!(rejected.is_err());
    assert_eq!(store.version(), 1);

    let decision = engine
        .evaluate_access(&alice("req-8", "handbook"))
        .await
        .unwrap();
    assert_eq!(decision.policy_version, 1);
    assert_eq!(decision.effect, Effect::Allow);
}

#[test]
fn test_shipped_fixtures_load() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures");

    let config = EngineConfig::load_from(&dir.join("config.yaml")).unwrap();
    assert_eq!(config.risk.step_up_threshold, 30);

    let set = gatekeeper::policy::PolicyDocument::load_from(&dir.join("policies.yaml"))
        .unwrap()
        .into_set()
        .unwrap();
    assert_eq!(set.version(), 2);
    assert_eq!(set.policies()[0].id, "deny-threat-indicators");

    let threats = ThreatIndicators::load_from(&dir.join("threats.yaml")).unwrap();
    assert_eq!(threats.epoch(), 1);
    assert!(threats.is_principal_flagged("mallory"));

    let sources = FixtureSources::load_from(&dir.join("sources.yaml")).unwrap();
    assert_eq!(sources.resources["prod-db"], Sensitivity::Restricted);
}
