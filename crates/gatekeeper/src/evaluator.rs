//! Policy decision point
//!
//! Decides allow, deny or challenge for one request. The active policy set
//! is captured once per evaluation. Matching runs in fixed steps:
//!
//! 1. the highest-priority matching deny wins outright
//! 2. otherwise the highest-priority matching challenge wins
//! 3. otherwise the highest-priority matching allow wins, unless the risk
//!    (or a degraded context) calls for step-up, which turns it into a
//!    challenge
//! 4. nothing matched: deny

use crate::context::{AccessContext, AccessRequest};
use crate::level::AssuranceLevel;
use crate::policy::{Effect, Policy, PolicySet, PolicyStore};
use crate::risk::RiskScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Result of an access evaluation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: String,

    /// The final decision
    pub effect: Effect,

    /// Why this effect was chosen
    pub reason: Reason,

    /// Details about the evaluation
    pub details: String,

    /// Policy that decided it (if any)
    pub matched_policy: Option<String>,

    /// Assurance the principal must present (challenges only)
    pub required_assurance: Option<AssuranceLevel>,

    pub risk_score: u32,

    /// Version of the policy set the decision was made against
    pub policy_version: u64,

    pub degraded: bool,

    /// When the facts behind the decision were observed
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        self.effect == Effect::Allow
    }
}

/// Reason for the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Denied by a matching deny policy
    PolicyDeny,
    /// Challenged by a matching challenge policy
    PolicyChallenge,
    /// Allowed by a matching allow policy
    PolicyAllow,
    /// An allow was raised to a challenge by the risk score
    RiskStepUp,
    /// An allow was raised to a challenge because the context is unverified
    DegradedContext,
    /// No policy matched
    DefaultDeny,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::PolicyDeny => "policy_deny",
            Reason::PolicyChallenge => "policy_challenge",
            Reason::PolicyAllow => "policy_allow",
            Reason::RiskStepUp => "risk_step_up",
            Reason::DegradedContext => "degraded_context",
            Reason::DefaultDeny => "default_deny",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evaluates requests against whatever set the store holds at call time
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate against a snapshot captured once at the start
    pub fn evaluate(
        &self,
        request: &AccessRequest,
        context: &AccessContext,
        risk: &RiskScore,
    ) -> Decision {
        let snapshot = self.store.snapshot();
        let decision = decide(&snapshot, request, context, risk);
        debug!(
            request_id = %decision.request_id,
            effect = %decision.effect,
            reason = %decision.reason,
            risk = decision.risk_score,
            policy_version = decision.policy_version,
            "policy evaluated"
        );
        decision
    }
}

/// Pure decision function over one policy set.
///
/// Identical inputs always give an identical decision.
pub fn decide(
    set: &PolicySet,
    request: &AccessRequest,
    context: &AccessContext,
    risk: &RiskScore,
) -> Decision {
    let matching: Vec<&Policy> = set
        .policies()
        .iter()
        .filter(|p| p.matches(request, context, risk))
        .collect();

    let first = |effect: Effect| matching.iter().find(|p| p.effect == effect).copied();

    let verdict = if let Some(policy) = first(Effect::Deny) {
        Verdict {
            effect: Effect::Deny,
            reason: Reason::PolicyDeny,
            details: policy_details(policy),
            matched_policy: Some(policy.id.clone()),
            required_assurance: None,
        }
    } else if let Some(policy) = first(Effect::Challenge) {
        let required = policy
            .required_assurance
            .unwrap_or(AssuranceLevel::Mfa)
            .max(risk.required_assurance);
        Verdict {
            effect: Effect::Challenge,
            reason: Reason::PolicyChallenge,
            details: policy_details(policy),
            matched_policy: Some(policy.id.clone()),
            required_assurance: Some(required),
        }
    } else if let Some(policy) = first(Effect::Allow) {
        if context.degraded || risk.step_up_required {
            let reason = if context.degraded {
                Reason::DegradedContext
            } else {
                Reason::RiskStepUp
            };
            Verdict {
                effect: Effect::Challenge,
                reason,
                details: format!(
                    "{} would allow, but risk {} requires step-up",
                    policy.id, risk.value
                ),
                matched_policy: Some(policy.id.clone()),
                required_assurance: Some(risk.required_assurance.max(AssuranceLevel::Mfa)),
            }
        } else {
            Verdict {
                effect: Effect::Allow,
                reason: Reason::PolicyAllow,
                details: policy_details(policy),
                matched_policy: Some(policy.id.clone()),
                required_assurance: None,
            }
        }
    } else {
        Verdict {
            effect: Effect::Deny,
            reason: Reason::DefaultDeny,
            details: "no policy matched".to_string(),
            matched_policy: None,
            required_assurance: None,
        }
    };

    Decision {
        request_id: request.request_id.clone(),
        effect: verdict.effect,
        reason: verdict.reason,
        details: verdict.details,
        matched_policy: verdict.matched_policy,
        required_assurance: verdict.required_assurance,
        risk_score: risk.value,
        policy_version: set.version(),
        degraded: context.degraded,
        timestamp: context.observed_at,
    }
}

struct Verdict {
    effect: Effect,
    reason: Reason,
    details: String,
    matched_policy: Option<String>,
    required_assurance: Option<AssuranceLevel>,
}

fn policy_details(policy: &Policy) -> String {
    if policy.description.is_empty() {
        format!("matched {}", policy.id)
    } else {
        format!("{}: {}", policy.id, policy.description)
    }
}
