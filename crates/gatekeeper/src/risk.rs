//! Risk scoring
//!
//! A pure function of the context and the threat snapshot. Each factor
//! produces a raw sub-score in `0..=100`; the factor contributes
//! `min(raw, cap) * weight / 100` points and the total is clamped to
//! `0..=100`. Weights and caps come from `RiskConfig`.
//!
//! A degraded context is lifted to at least the step-up threshold, so an
//! unverified context can never look like a clean one.

use crate::config::{window, FactorConfig, RiskConfig, MAX_RISK};
use crate::context::{AccessContext, NetworkZone};
use crate::level::{AssuranceLevel, Sensitivity};
use crate::threat::{ThreatIndicators, ThreatMatch};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The independent inputs to the risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    IdentityFreshness,
    DeviceCompliance,
    NetworkTrust,
    ResourceSensitivity,
    ThreatIntel,
}

impl FactorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorKind::IdentityFreshness => "identity_freshness",
            FactorKind::DeviceCompliance => "device_compliance",
            FactorKind::NetworkTrust => "network_trust",
            FactorKind::ResourceSensitivity => "resource_sensitivity",
            FactorKind::ThreatIntel => "threat_intel",
        }
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One factor's part of the score, kept for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub kind: FactorKind,
    /// Raw sub-score before cap and weight
    pub raw: u32,
    /// Points added to the total
    pub contribution: u32,
    pub note: String,
}

/// Derived risk for one context. Always recomputed, never stored as truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScore {
    pub value: u32,
    pub factors: Vec<RiskFactor>,
    pub threat_matches: Vec<ThreatMatch>,
    /// Assurance the principal must hold for this risk
    pub required_assurance: AssuranceLevel,
    pub step_up_required: bool,
    /// Whether the degraded-context floor raised the value
    pub degraded_floor_applied: bool,
}

impl RiskScore {
    pub fn has_threat_match(&self) -> bool {
        !self.threat_matches.is_empty()
    }

    /// Short factor summary, e.g. `network_trust=15 resource_sensitivity=20`
    pub fn summary(&self) -> String {
        self.factors
            .iter()
            .filter(|f| f.contribution > 0)
            .map(|f| format!("{}={}", f.kind, f.contribution))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Converts contexts into risk scores
#[derive(Debug, Clone, Default)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score a context against a threat snapshot
    pub fn score(&self, context: &AccessContext, threats: &ThreatIndicators) -> RiskScore {
        let threat_matches = threats.matches(context);

        let (identity_raw, identity_note) = self.identity_risk(context);
        let (device_raw, device_note) = self.device_risk(context);
        let (network_raw, network_note) = network_risk(context.network);
        let (sensitivity_raw, sensitivity_note) = sensitivity_risk(context.sensitivity);
        let (threat_raw, threat_note) = if threat_matches.is_empty() {
            (0, "no indicator match".to_string())
        } else {
            let ids: Vec<&str> = threat_matches.iter().map(|m| m.value.as_str()).collect();
            (MAX_RISK, format!("indicator match: {}", ids.join(", ")))
        };

        let factors = vec![
            weigh(FactorKind::IdentityFreshness, identity_raw, self.config.identity, identity_note),
            weigh(FactorKind::DeviceCompliance, device_raw, self.config.device, device_note),
            weigh(FactorKind::NetworkTrust, network_raw, self.config.network, network_note),
            weigh(
                FactorKind::ResourceSensitivity,
                sensitivity_raw,
                self.config.sensitivity,
                sensitivity_note,
            ),
            weigh(FactorKind::ThreatIntel, threat_raw, self.config.threat, threat_note),
        ];

        let mut value = factors
            .iter()
            .map(|f| f.contribution)
            .sum::<u32>()
            .min(MAX_RISK);

        let mut degraded_floor_applied = false;
        if context.degraded && value < self.config.step_up_threshold {
            value = self.config.step_up_threshold;
            degraded_floor_applied = true;
        }

        let mut score = self.with_value(value);
        score.factors = factors;
        score.threat_matches = threat_matches;
        score.degraded_floor_applied = degraded_floor_applied;
        score
    }

    /// A score carrying only a total value, classified by the thresholds.
    /// Useful for probing how a policy set behaves across the risk range.
    pub fn with_value(&self, value: u32) -> RiskScore {
        let value = value.min(MAX_RISK);
        RiskScore {
            value,
            factors: Vec::new(),
            threat_matches: Vec::new(),
            required_assurance: self.assurance_for(value),
            step_up_required: value >= self.config.step_up_threshold,
            degraded_floor_applied: false,
        }
    }

    /// Assurance level demanded by a risk value
    pub fn assurance_for(&self, value: u32) -> AssuranceLevel {
        if value >= self.config.high_assurance_threshold {
            AssuranceLevel::StepUp
        } else if value >= self.config.step_up_threshold {
            AssuranceLevel::Mfa
        } else {
            AssuranceLevel::Password
        }
    }

    fn identity_risk(&self, context: &AccessContext) -> (u32, String) {
        let identity = &context.identity;
        let (mut raw, mut note) = match identity.since_strong_auth_secs {
            None => (MAX_RISK, "no strong authentication on record".to_string()),
            Some(secs) if secs <= self.config.fresh_auth_secs => {
                (0, format!("strong auth {}s ago", secs))
            }
            Some(secs) if secs <= self.config.stale_auth_secs => {
                (40, format!("strong auth {}s ago, ageing", secs))
            }
            Some(secs) => (80, format!("strong auth {}s ago, stale", secs)),
        };
        if !identity.mfa_satisfied {
            raw += 40;
            note.push_str(", mfa not satisfied");
        }
        (raw.min(MAX_RISK), note)
    }

    fn device_risk(&self, context: &AccessContext) -> (u32, String) {
        let device = &context.device;
        if !device.registered {
            return (MAX_RISK, "device not registered".to_string());
        }
        if !device.compliant {
            return (70, "device not compliant".to_string());
        }
        let healthy_within = window(self.config.device_healthy_within_secs);
        match device.last_seen_healthy {
            Some(seen) if context.observed_at - seen <= healthy_within => {
                (0, "device compliant".to_string())
            }
            Some(_) => (30, "device health report stale".to_string()),
            None => (30, "device never reported healthy".to_string()),
        }
    }
}

fn network_risk(zone: NetworkZone) -> (u32, String) {
    let raw = match zone {
        NetworkZone::Trusted => 0,
        NetworkZone::Guest => 40,
        NetworkZone::Unknown => 60,
        NetworkZone::Flagged => MAX_RISK,
    };
    (raw, format!("{} network", zone))
}

fn sensitivity_risk(sensitivity: Sensitivity) -> (u32, String) {
    let raw = match sensitivity {
        Sensitivity::Public => 0,
        Sensitivity::Internal => 20,
        Sensitivity::Confidential => 50,
        Sensitivity::Restricted => 80,
    };
    (raw, format!("{} resource", sensitivity))
}

fn weigh(kind: FactorKind, raw: u32, factor: FactorConfig, note: String) -> RiskFactor {
    RiskFactor {
        kind,
        raw,
        contribution: raw.min(factor.cap) * factor.weight / 100,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AccessRequest, DeviceFacts, IdentityFacts};
    use chrono::Utc;

    fn context(network: NetworkZone, sensitivity: Sensitivity) -> AccessContext {
        let now = Utc::now();
        let request = AccessRequest::new("req", "alice", "res", "read")
            .with_device("laptop-1")
            .with_origin("10.0.0.5");
        AccessContext::from_facts(
            &request,
            Some(IdentityFacts {
                roles: Default::default(),
                mfa_satisfied: true,
                since_strong_auth_secs: Some(60),
            }),
            Some(DeviceFacts {
                registered: true,
                compliant: true,
                last_seen_healthy: Some(now),
            }),
            Some(network),
            Some(sensitivity),
            now,
        )
    }

    #[test]
    fn test_healthy_public_is_zero() {
        let engine = RiskEngine::default();
        let score = engine.score(
            &context(NetworkZone::Trusted, Sensitivity::Public),
            &ThreatIndicators::default(),
        );
        assert_eq!(score.value, 0);
        assert!(!score.step_up_required);
        assert_eq!(score.required_assurance, AssuranceLevel::Password);
        assert_eq!(score.factors.len(), 5);
    }

    #[test]
    fn test_unknown_network_restricted_needs_step_up() {
        let engine = RiskEngine::default();
        let score = engine.score(
            &context(NetworkZone::Unknown, Sensitivity::Restricted),
            &ThreatIndicators::default(),
        );
        // 60 * 25% + 80 * 25%
        assert_eq!(score.value, 35);
        assert!(score.step_up_required);
        assert_eq!(score.required_assurance, AssuranceLevel::Mfa);
        assert_eq!(score.summary(), "network_trust=15 resource_sensitivity=20");
    }

    #[test]
    fn test_threat_match_saturates() {
        let engine = RiskEngine::default();
        let threats = ThreatIndicators::builder(1).principal("alice").build();
        let score = engine.score(&context(NetworkZone::Trusted, Sensitivity::Public), &threats);
        assert_eq!(score.value, MAX_RISK);
        assert!(score.has_threat_match());
        assert_eq!(score.required_assurance, AssuranceLevel::StepUp);
    }

    #[test]
    fn test_degraded_floor() {
        let engine = RiskEngine::default();
        let mut ctx = context(NetworkZone::Trusted, Sensitivity::Public);
        ctx.degraded = true;
        let score = engine.score(&ctx, &ThreatIndicators::default());
        assert_eq!(score.value, engine.config().step_up_threshold);
        assert!(score.degraded_floor_applied);
        assert!(score.step_up_required);
    }

    #[test]
    fn test_caps_and_weights_apply() {
        let mut config = RiskConfig::default();
        config.network = FactorConfig::new(50, 40);
        let engine = RiskEngine::new(config);
        let score = engine.score(
            &context(NetworkZone::Flagged, Sensitivity::Public),
            &ThreatIndicators::default(),
        );
        // min(100, 40) * 50%
        assert_eq!(score.value, 20);
    }

    #[test]
    fn test_stale_identity_without_mfa() {
        let engine = RiskEngine::default();
        let mut ctx = context(NetworkZone::Trusted, Sensitivity::Public);
        ctx.identity.mfa_satisfied = false;
        ctx.identity.since_strong_auth_secs = Some(10 * 60 * 60);
        let score = engine.score(&ctx, &ThreatIndicators::default());
        let identity = &score.factors[0];
        assert_eq!(identity.raw, 100);
        assert_eq!(identity.contribution, 25);
    }

    #[test]
    fn test_stale_device_health() {
        let engine = RiskEngine::default();
        let mut ctx = context(NetworkZone::Trusted, Sensitivity::Public);
        ctx.device.last_seen_healthy = Some(ctx.observed_at - chrono::Duration::days(3));
        let score = engine.score(&ctx, &ThreatIndicators::default());
        assert_eq!(score.factors[1].raw, 30);
    }

    #[test]
    fn test_oversized_device_window_is_clamped() {
        let mut config = RiskConfig::default();
        config.device_healthy_within_secs = 100_000_000_000_000_000;
        let engine = RiskEngine::new(config);
        let mut ctx = context(NetworkZone::Trusted, Sensitivity::Public);
        ctx.device.last_seen_healthy = Some(ctx.observed_at - chrono::Duration::days(3));
        let score = engine.score(&ctx, &ThreatIndicators::default());
        assert_eq!(score.factors[1].raw, 0);
    }

    #[test]
    fn test_score_is_bounded() {
        let engine = RiskEngine::default();
        assert_eq!(engine.with_value(250).value, MAX_RISK);
    }
}
