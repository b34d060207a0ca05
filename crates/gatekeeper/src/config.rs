//! Engine configuration management
//!
//! Configuration file: ~/.config/gatekeeper/gatekeeper.yaml
//!
//! Risk weights, thresholds and timeouts are configuration rather than code,
//! so they can be tuned without redeploying the decision logic. Every field
//! has a default, so partial files are fine.

use anyhow::{bail, Context, Result};
use gatekeeper_core::Paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum value of a risk score or a raw sub-score
pub const MAX_RISK: u32 = 100;

/// Longest accepted time window for any `*_secs` setting (ten years)
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Longest accepted audit retention
pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

/// Seconds as a chrono duration, clamped to `MAX_WINDOW_SECS`
pub fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Global engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Context aggregation timeouts
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Risk weights, caps and thresholds
    #[serde(default)]
    pub risk: RiskConfig,

    /// Continuous-authentication monitor settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Audit settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// Idempotent retry settings for the evaluate-access call
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Threat intelligence refresh settings
    #[serde(default)]
    pub threats: ThreatConfig,

    /// Policy document to install at startup (built-in baseline otherwise)
    #[serde(default)]
    pub policies: Option<String>,
}

impl EngineConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Paths::new().config_file())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read engine config from {:?}", path))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse engine config from {:?}", path))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Paths::new().config_file())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.aggregator.per_source_timeout_ms == 0 || self.aggregator.aggregate_timeout_ms == 0 {
            bail!("aggregator timeouts must be greater than zero");
        }
        if self.aggregator.aggregate_timeout_ms < self.aggregator.per_source_timeout_ms {
            bail!(
                "aggregate timeout ({}ms) is shorter than the per-source timeout ({}ms)",
                self.aggregator.aggregate_timeout_ms,
                self.aggregator.per_source_timeout_ms
            );
        }

        for (name, factor) in self.risk.factors() {
            if factor.weight > MAX_RISK || factor.cap > MAX_RISK {
                bail!("risk factor {} has weight or cap above {}", name, MAX_RISK);
            }
        }
        if self.risk.step_up_threshold > self.risk.high_assurance_threshold {
            bail!("step-up threshold must not exceed the high-assurance threshold");
        }
        if self.risk.high_assurance_threshold > MAX_RISK {
            bail!("high-assurance threshold must be at most {}", MAX_RISK);
        }
        if self.risk.fresh_auth_secs > self.risk.stale_auth_secs {
            bail!("fresh authentication window must not exceed the stale window");
        }

        if self.monitor.reevaluation_interval_ms == 0 {
            bail!("monitor re-evaluation interval must be greater than zero");
        }
        if self.monitor.idle_timeout_secs == 0 || self.monitor.max_lifetime_secs == 0 {
            bail!("session idle timeout and lifetime must be greater than zero");
        }

        let windows = [
            ("risk.fresh_auth_secs", self.risk.fresh_auth_secs),
            ("risk.stale_auth_secs", self.risk.stale_auth_secs),
            ("risk.device_healthy_within_secs", self.risk.device_healthy_within_secs),
            ("monitor.idle_timeout_secs", self.monitor.idle_timeout_secs),
            ("monitor.max_lifetime_secs", self.monitor.max_lifetime_secs),
        ];
        for (name, secs) in windows {
            if secs > MAX_WINDOW_SECS {
                bail!("{} is {}s, more than the {}s limit", name, secs, MAX_WINDOW_SECS);
            }
        }
        if self.audit.retention_days > MAX_RETENTION_DAYS {
            bail!("audit retention must be at most {} days", MAX_RETENTION_DAYS);
        }
        Ok(())
    }

    /// Resolved audit log location
    pub fn audit_path(&self) -> PathBuf {
        match &self.audit.path {
            Some(path) => PathBuf::from(expand_path(path)),
            None => Paths::new().audit_log(),
        }
    }

    /// Resolved policy document location, if one is configured
    pub fn policy_path(&self) -> Option<PathBuf> {
        self.policies.as_deref().map(|p| PathBuf::from(expand_path(p)))
    }
}

/// Context aggregation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Bound on each individual collaborator query
    #[serde(default = "default_per_source_timeout_ms")]
    pub per_source_timeout_ms: u64,

    /// Bound on the whole aggregation
    #[serde(default = "default_aggregate_timeout_ms")]
    pub aggregate_timeout_ms: u64,
}

fn default_per_source_timeout_ms() -> u64 {
    250
}

fn default_aggregate_timeout_ms() -> u64 {
    1000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_ms: default_per_source_timeout_ms(),
            aggregate_timeout_ms: default_aggregate_timeout_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.per_source_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }
}

/// Weight and cap for one risk factor
///
/// A factor contributes `min(raw, cap) * weight / 100` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorConfig {
    pub weight: u32,
    pub cap: u32,
}

impl FactorConfig {
    pub const fn new(weight: u32, cap: u32) -> Self {
        Self { weight, cap }
    }
}

/// Risk scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_quarter_factor")]
    pub identity: FactorConfig,

    #[serde(default = "default_quarter_factor")]
    pub device: FactorConfig,

    #[serde(default = "default_quarter_factor")]
    pub network: FactorConfig,

    #[serde(default = "default_quarter_factor")]
    pub sensitivity: FactorConfig,

    #[serde(default = "default_threat_factor")]
    pub threat: FactorConfig,

    /// Scores at or above this require step-up; degraded contexts are
    /// forced up to it
    #[serde(default = "default_step_up_threshold")]
    pub step_up_threshold: u32,

    /// Scores at or above this require the strongest assurance
    #[serde(default = "default_high_assurance_threshold")]
    pub high_assurance_threshold: u32,

    /// Strong authentication younger than this carries no freshness risk
    #[serde(default = "default_fresh_auth_secs")]
    pub fresh_auth_secs: u64,

    /// Strong authentication older than this counts as stale
    #[serde(default = "default_stale_auth_secs")]
    pub stale_auth_secs: u64,

    /// A device not reported healthy within this window carries residual risk
    #[serde(default = "default_device_healthy_within_secs")]
    pub device_healthy_within_secs: u64,
}

fn default_quarter_factor() -> FactorConfig {
    FactorConfig::new(25, MAX_RISK)
}

fn default_threat_factor() -> FactorConfig {
    FactorConfig::new(100, MAX_RISK)
}

fn default_step_up_threshold() -> u32 {
    30
}

fn default_high_assurance_threshold() -> u32 {
    60
}

fn default_fresh_auth_secs() -> u64 {
    60 * 60
}

fn default_stale_auth_secs() -> u64 {
    8 * 60 * 60
}

fn default_device_healthy_within_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            identity: default_quarter_factor(),
            device: default_quarter_factor(),
            network: default_quarter_factor(),
            sensitivity: default_quarter_factor(),
            threat: default_threat_factor(),
            step_up_threshold: default_step_up_threshold(),
            high_assurance_threshold: default_high_assurance_threshold(),
            fresh_auth_secs: default_fresh_auth_secs(),
            stale_auth_secs: default_stale_auth_secs(),
            device_healthy_within_secs: default_device_healthy_within_secs(),
        }
    }
}

impl RiskConfig {
    /// All factor settings with their names
    pub fn factors(&self) -> [(&'static str, FactorConfig); 5] {
        [
            ("identity", self.identity),
            ("device", self.device),
            ("network", self.network),
            ("sensitivity", self.sensitivity),
            ("threat", self.threat),
        ]
    }
}

/// Continuous-authentication monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Fixed interval between re-evaluations of one session
    #[serde(default = "default_reevaluation_interval_ms")]
    pub reevaluation_interval_ms: u64,

    /// Sessions without activity for this long are terminated
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sessions older than this are terminated regardless of activity
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

fn default_reevaluation_interval_ms() -> u64 {
    60_000
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_lifetime_secs() -> u64 {
    12 * 60 * 60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reevaluation_interval_ms: default_reevaluation_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn reevaluation_interval(&self) -> Duration {
        Duration::from_millis(self.reevaluation_interval_ms)
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        window(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> chrono::Duration {
        window(self.max_lifetime_secs)
    }
}

/// Audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit log path (defaults to the data directory)
    #[serde(default)]
    pub path: Option<String>,

    /// Retention in days
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: u32,
}

fn default_audit_retention_days() -> u32 {
    90
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: default_audit_retention_days(),
        }
    }
}

/// Idempotent retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a decision is replayed for a retried request id
    #[serde(default = "default_idempotency_window_secs")]
    pub window_secs: u64,

    /// Entries kept before expired ones are pruned
    #[serde(default = "default_idempotency_capacity")]
    pub capacity: usize,
}

fn default_idempotency_window_secs() -> u64 {
    5 * 60
}

fn default_idempotency_capacity() -> usize {
    10_000
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            window_secs: default_idempotency_window_secs(),
            capacity: default_idempotency_capacity(),
        }
    }
}

/// Threat intelligence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    /// Interval between pulls from the threat feed
    #[serde(default = "default_threat_refresh_secs")]
    pub refresh_interval_secs: u64,

    /// Indicator file loaded at startup
    #[serde(default)]
    pub path: Option<String>,
}

fn default_threat_refresh_secs() -> u64 {
    5 * 60
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_threat_refresh_secs(),
            path: None,
        }
    }
}

impl ThreatConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn indicator_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(|p| PathBuf::from(expand_path(p)))
    }
}

/// Expand ~ and environment variables in path
fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}
