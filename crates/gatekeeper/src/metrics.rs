//! Decision counters and health
//!
//! Counters are plain atomics: recording never takes a lock, so reading
//! them can never slow the decision path.

use crate::policy::Effect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Running totals for the evaluate-access path
#[derive(Debug, Default)]
pub struct DecisionMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    challenged: AtomicU64,
    degraded: AtomicU64,
    audit_failures: AtomicU64,
    latency_micros_total: AtomicU64,
    last_audit_failed: AtomicBool,
}

impl DecisionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one returned decision
    pub fn record(&self, effect: Effect, degraded: bool, latency: Duration) {
        let counter = match effect {
            Effect::Allow => &self.allowed,
            Effect::Deny => &self.denied,
            Effect::Challenge => &self.challenged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_micros_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.last_audit_failed.store(false, Ordering::Relaxed);
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
        self.last_audit_failed.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let denied = self.denied.load(Ordering::Relaxed);
        let challenged = self.challenged.load(Ordering::Relaxed);
        let total = allowed + denied + challenged;
        let latency = self.latency_micros_total.load(Ordering::Relaxed);

        MetricsSnapshot {
            allowed,
            denied,
            challenged,
            total,
            degraded: self.degraded.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            mean_latency_ms: if total == 0 {
                0.0
            } else {
                latency as f64 / total as f64 / 1000.0
            },
        }
    }

    pub fn health(&self) -> HealthState {
        if self.last_audit_failed.load(Ordering::Relaxed) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub challenged: u64,
    pub total: u64,
    pub degraded: u64,
    pub audit_failures: u64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// The most recent audit write failed
    Degraded,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Engine status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub health: HealthState,
    pub policy_version: u64,
    pub policy_count: usize,
    pub threat_epoch: u64,
    pub threat_indicators: usize,
    pub active_sessions: usize,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_mean_latency() {
        let metrics = DecisionMetrics::new();
        metrics.record(Effect::Allow, false, Duration::from_millis(2));
        metrics.record(Effect::Deny, true, Duration::from_millis(4));
        metrics.record(Effect::Challenge, false, Duration::from_millis(6));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.degraded, 1);
        assert!((snapshot.mean_latency_ms - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_follows_last_audit_write() {
        let metrics = DecisionMetrics::new();
        assert_eq!(metrics.health(), HealthState::Healthy);

        metrics.record_audit_failure();
        assert_eq!(metrics.health(), HealthState::Degraded);
        assert_eq!(metrics.snapshot().audit_failures, 1);

        metrics.record(Effect::Allow, false, Duration::from_millis(1));
        assert_eq!(metrics.health(), HealthState::Healthy);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = DecisionMetrics::new().snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.mean_latency_ms, 0.0);
    }
}
