//! Policies and the active policy set
//!
//! A policy set is an immutable, versioned list of rules strictly ordered by
//! priority. The store swaps whole sets atomically; evaluations hold an
//! `Arc` to the set they started with, so a reload mid-evaluation cannot
//! produce a partial match.
//!
//! Policy documents are YAML:
//!
//! ```yaml
//! version: 2
//! policies:
//!   - id: deny-flagged-network
//!     priority: 900
//!     effect: deny
//!     match:
//!       zones: [flagged]
//! ```

use crate::context::{AccessContext, AccessRequest, NetworkZone};
use crate::config::MAX_RISK;
use crate::error::{EngineError, Result};
use crate::level::{AssuranceLevel, Sensitivity};
use crate::risk::RiskScore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// What a matching policy asks for.
///
/// Ordered by restrictiveness: allow < challenge < deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Challenge,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Challenge => "challenge",
            Effect::Deny => "deny",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "allow" => Some(Effect::Allow),
            "challenge" => Some(Effect::Challenge),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conditions a request must meet for a policy to apply.
///
/// Every list is "any of"; an empty list places no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Glob patterns over resource ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitivities: Vec<Sensitivity>,

    /// Principal must hold at least one of these roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles_any: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<NetworkZone>,

    /// For deny and challenge: applies when risk >= threshold.
    /// For allow: applies when risk < threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_threshold: Option<u32>,

    /// Require (or forbid) a threat indicator match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_match: Option<bool>,

    #[serde(skip)]
    pub(crate) compiled: Vec<glob::Pattern>,
}

impl Predicate {
    /// A predicate that matches every request
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_resources<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_sensitivities(mut self, tiers: &[Sensitivity]) -> Self {
        self.sensitivities = tiers.to_vec();
        self
    }

    pub fn for_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles_any = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_zones(mut self, zones: &[NetworkZone]) -> Self {
        self.zones = zones.to_vec();
        self
    }

    pub fn at_risk(mut self, threshold: u32) -> Self {
        self.risk_threshold = Some(threshold);
        self
    }

    pub fn on_threat_match(mut self, wanted: bool) -> Self {
        self.threat_match = Some(wanted);
        self
    }

    fn compile(&mut self) -> std::result::Result<(), String> {
        self.compiled = self
            .resources
            .iter()
            .map(|p| glob::Pattern::new(p).map_err(|e| format!("bad resource pattern {:?}: {}", p, e)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Patterns are compiled when a set is built; a predicate that never went
    /// through a set compiles them here. An invalid pattern matches nothing.
    fn resource_matches(&self, resource_id: &str) -> bool {
        if self.resources.is_empty() {
            return true;
        }
        if self.compiled.len() == self.resources.len() {
            return self.compiled.iter().any(|p| p.matches(resource_id));
        }
        self.resources
            .iter()
            .any(|p| glob::Pattern::new(p).is_ok_and(|p| p.matches(resource_id)))
    }

    fn matches(
        &self,
        effect: Effect,
        request: &AccessRequest,
        context: &AccessContext,
        risk: &RiskScore,
    ) -> bool {
        if !self.resource_matches(&request.resource_id) {
            return false;
        }
        if !self.actions.is_empty()
            && !self.actions.iter().any(|a| a == "*" || *a == request.action)
        {
            return false;
        }
        if !self.sensitivities.is_empty() && !self.sensitivities.contains(&context.sensitivity) {
            return false;
        }
        if !self.roles_any.is_empty()
            && !self.roles_any.iter().any(|r| context.identity.roles.contains(r))
        {
            return false;
        }
        if !self.zones.is_empty() && !self.zones.contains(&context.network) {
            return false;
        }
        if let Some(wanted) = self.threat_match {
            if risk.has_threat_match() != wanted {
                return false;
            }
        }
        match (self.risk_threshold, effect) {
            (None, _) => true,
            (Some(threshold), Effect::Allow) => risk.value < threshold,
            (Some(threshold), _) => risk.value >= threshold,
        }
    }
}

/// One ordered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,

    /// Higher priority is considered first
    pub priority: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(rename = "match", default)]
    pub predicate: Predicate,

    pub effect: Effect,

    /// Assurance a challenge demands; the risk-derived level applies if higher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_assurance: Option<AssuranceLevel>,
}

impl Policy {
    pub fn new(id: impl Into<String>, priority: u32, effect: Effect, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            priority,
            description: String::new(),
            predicate,
            effect,
            required_assurance: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requiring(mut self, level: AssuranceLevel) -> Self {
        self.required_assurance = Some(level);
        self
    }

    /// Whether this policy applies to the request at the given risk
    pub fn matches(&self, request: &AccessRequest, context: &AccessContext, risk: &RiskScore) -> bool {
        self.predicate.matches(self.effect, request, context, risk)
    }
}

/// Immutable, validated, priority-ordered set of policies
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    version: u64,
    policies: Vec<Policy>,
}

impl PolicySet {
    /// Validate and order a set of policies.
    ///
    /// Rejects empty or duplicate ids, duplicate priorities, thresholds
    /// outside the risk range, bad resource patterns, and assurance
    /// requirements on policies that are not challenges.
    pub fn new(version: u64, mut policies: Vec<Policy>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut priorities = HashSet::new();

        for policy in &mut policies {
            if policy.id.trim().is_empty() {
                return Err(invalid("policy with empty id"));
            }
            if !ids.insert(policy.id.clone()) {
                return Err(invalid(format!("duplicate policy id {}", policy.id)));
            }
            if !priorities.insert(policy.priority) {
                return Err(invalid(format!(
                    "priority {} used more than once (policy {})",
                    policy.priority, policy.id
                )));
            }
            if let Some(threshold) = policy.predicate.risk_threshold {
                if threshold > MAX_RISK {
                    return Err(invalid(format!(
                        "policy {} risk threshold {} exceeds {}",
                        policy.id, threshold, MAX_RISK
                    )));
                }
            }
            if policy.required_assurance.is_some() && policy.effect != Effect::Challenge {
                return Err(invalid(format!(
                    "policy {} sets required_assurance but is not a challenge",
                    policy.id
                )));
            }
            policy
                .predicate
                .compile()
                .map_err(|e| invalid(format!("policy {}: {}", policy.id, e)))?;
        }

        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { version, policies })
    }

    /// Built-in set used when no policy document is configured
    pub fn baseline() -> Self {
        let policies = vec![
            Policy::new(
                "deny-threat-indicators",
                1000,
                Effect::Deny,
                Predicate {
                    threat_match: Some(true),
                    ..Default::default()
                },
            )
            .describe("principal, device or network appears in threat intelligence"),
            Policy::new(
                "deny-flagged-network",
                900,
                Effect::Deny,
                Predicate {
                    zones: vec![NetworkZone::Flagged],
                    ..Default::default()
                },
            )
            .describe("request originates from a flagged network"),
            Policy::new(
                "deny-high-risk",
                800,
                Effect::Deny,
                Predicate {
                    risk_threshold: Some(80),
                    ..Default::default()
                },
            )
            .describe("risk too high to permit"),
            Policy::new(
                "challenge-elevated-risk",
                400,
                Effect::Challenge,
                Predicate {
                    risk_threshold: Some(30),
                    ..Default::default()
                },
            )
            .describe("elevated risk requires step-up")
            .requiring(AssuranceLevel::Mfa),
            Policy::new(
                "allow-public-internal",
                200,
                Effect::Allow,
                Predicate {
                    sensitivities: vec![Sensitivity::Public, Sensitivity::Internal],
                    risk_threshold: Some(30),
                    ..Default::default()
                },
            )
            .describe("low-risk access to public and internal resources"),
            Policy::new(
                "allow-staff-sensitive",
                100,
                Effect::Allow,
                Predicate {
                    sensitivities: vec![Sensitivity::Confidential, Sensitivity::Restricted],
                    roles_any: vec!["staff".to_string(), "admin".to_string()],
                    risk_threshold: Some(30),
                    ..Default::default()
                },
            )
            .describe("low-risk staff access to sensitive resources"),
        ];

        // Static and known to be valid; validation only compiles patterns here
        Self::new(1, policies).unwrap_or(Self {
            version: 1,
            policies: Vec::new(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Policies in descending priority order
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn get(&self, id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            version: self.version,
            policies: self.policies.clone(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::PolicySetInvalid(reason.into())
}

/// Serialized form of a policy set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u64,

    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl PolicyDocument {
    /// Load a policy document from YAML
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy document from {:?}", path))?;
        let document: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse policy document from {:?}", path))?;
        Ok(document)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Validate into an installable set
    pub fn into_set(self) -> Result<PolicySet> {
        PolicySet::new(self.version, self.policies)
    }
}

/// Process-wide holder of the active policy set
pub struct PolicyStore {
    tx: watch::Sender<Arc<PolicySet>>,
}

impl PolicyStore {
    pub fn new(initial: PolicySet) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Validate and install a new set in one step
    pub fn install(&self, version: u64, policies: Vec<Policy>) -> Result<u64> {
        match PolicySet::new(version, policies) {
            Ok(set) => self.install_set(set),
            Err(e) => {
                warn!("{}; keeping version {}", e, self.version());
                Err(e)
            }
        }
    }

    /// Atomically swap in a validated set.
    ///
    /// The version must be newer than the active one; otherwise the active
    /// set stays in place.
    pub fn install_set(&self, set: PolicySet) -> Result<u64> {
        let next = Arc::new(set);
        let mut outcome = Ok(next.version);

        self.tx.send_if_modified(|active| {
            if next.version <= active.version {
                outcome = Err(invalid(format!(
                    "version {} is not newer than active version {}",
                    next.version, active.version
                )));
                false
            } else {
                *active = next.clone();
                true
            }
        });

        match &outcome {
            Ok(version) => info!(version, policies = next.len(), "policy set installed"),
            Err(e) => warn!("{}", e),
        }
        outcome
    }

    /// The active set; safe to hold for the length of an evaluation or longer
    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(PolicySet::baseline())
    }
}
