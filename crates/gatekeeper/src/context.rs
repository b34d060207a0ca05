//! Access requests and the per-request context
//!
//! The aggregator queries the four collaborators concurrently, each under
//! its own timeout, with the whole gather under an aggregate timeout. A
//! source that fails or times out is replaced by its most conservative value
//! and the context is marked degraded. An aggregate timeout yields a fully
//! degraded context; aggregation itself never fails.

use crate::config::AggregatorConfig;
use crate::error::EngineError;
use crate::level::Sensitivity;
use crate::sources::{
    DevicePostureSource, IdentitySource, NetworkContextSource, ResourceClassifier, SourceError,
    SourceKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One request to use a protected resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Unique per logical request; retries reuse it
    pub request_id: String,
    pub principal_id: String,
    pub resource_id: String,
    pub action: String,
    /// Device the request was made from, if known
    #[serde(default)]
    pub device_id: Option<String>,
    /// Network identifier (IP, segment id) the request came from
    #[serde(default)]
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AccessRequest {
    pub fn new(
        request_id: impl Into<String>,
        principal_id: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            principal_id: principal_id.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            device_id: None,
            origin: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// What the identity source knows about a principal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFacts {
    pub roles: BTreeSet<String>,
    pub mfa_satisfied: bool,
    /// Seconds since the last strong authentication; `None` if never
    pub since_strong_auth_secs: Option<u64>,
}

impl IdentityFacts {
    /// No roles, no MFA, no strong authentication on record
    pub fn conservative() -> Self {
        Self::default()
    }
}

/// What the device posture source knows about a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFacts {
    pub registered: bool,
    pub compliant: bool,
    pub last_seen_healthy: Option<DateTime<Utc>>,
}

impl DeviceFacts {
    /// Unregistered, non-compliant, never seen healthy
    pub fn conservative() -> Self {
        Self::default()
    }
}

/// Classification of the originating network segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkZone {
    Trusted,
    Guest,
    Unknown,
    Flagged,
}

impl NetworkZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkZone::Trusted => "trusted",
            NetworkZone::Guest => "guest",
            NetworkZone::Unknown => "unknown",
            NetworkZone::Flagged => "flagged",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            NetworkZone::Trusted,
            NetworkZone::Guest,
            NetworkZone::Unknown,
            NetworkZone::Flagged,
        ]
    }
}

impl fmt::Display for NetworkZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything known about one request at the instant it was evaluated.
///
/// Built once and never mutated. `degraded` is true whenever any fact is a
/// conservative stand-in rather than an answer from its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub request_id: String,
    pub principal_id: String,
    pub resource_id: String,
    pub action: String,
    pub device_id: Option<String>,
    pub origin: Option<String>,

    pub identity: IdentityFacts,
    pub device: DeviceFacts,
    pub network: NetworkZone,
    pub sensitivity: Sensitivity,

    pub degraded: bool,
    /// Sources whose facts were substituted
    pub degraded_sources: BTreeSet<SourceKind>,
    /// Whether the aggregate deadline expired
    pub aggregate_timed_out: bool,

    /// When the facts were gathered
    pub observed_at: DateTime<Utc>,
}

impl AccessContext {
    /// Build a context from whatever facts were obtained.
    ///
    /// Missing facts are replaced by conservative values and recorded as
    /// degraded sources.
    pub fn from_facts(
        request: &AccessRequest,
        identity: Option<IdentityFacts>,
        device: Option<DeviceFacts>,
        network: Option<NetworkZone>,
        sensitivity: Option<Sensitivity>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let mut degraded_sources = BTreeSet::new();
        if identity.is_none() {
            degraded_sources.insert(SourceKind::Identity);
        }
        if device.is_none() {
            degraded_sources.insert(SourceKind::DevicePosture);
        }
        if network.is_none() {
            degraded_sources.insert(SourceKind::NetworkContext);
        }
        if sensitivity.is_none() {
            degraded_sources.insert(SourceKind::ResourceClassifier);
        }

        Self {
            request_id: request.request_id.clone(),
            principal_id: request.principal_id.clone(),
            resource_id: request.resource_id.clone(),
            action: request.action.clone(),
            device_id: request.device_id.clone(),
            origin: request.origin.clone(),
            identity: identity.unwrap_or_else(IdentityFacts::conservative),
            device: device.unwrap_or_else(DeviceFacts::conservative),
            network: network.unwrap_or(NetworkZone::Unknown),
            sensitivity: sensitivity.unwrap_or(Sensitivity::Restricted),
            degraded: !degraded_sources.is_empty(),
            degraded_sources,
            aggregate_timed_out: false,
            observed_at,
        }
    }

    /// Every fact substituted; used when the aggregate deadline expires
    pub fn fully_degraded(request: &AccessRequest, observed_at: DateTime<Utc>) -> Self {
        let mut context = Self::from_facts(request, None, None, None, None, observed_at);
        context.aggregate_timed_out = true;
        context
    }

    /// Whether this context was assembled entirely from live answers
    pub fn is_fully_verified(&self) -> bool {
        !self.degraded
    }
}

/// Assembles an `AccessContext` for one request from the collaborators
pub struct ContextAggregator {
    identity: Arc<dyn IdentitySource>,
    devices: Arc<dyn DevicePostureSource>,
    networks: Arc<dyn NetworkContextSource>,
    classifier: Arc<dyn ResourceClassifier>,
    config: AggregatorConfig,
}

impl ContextAggregator {
    pub fn new(
        identity: Arc<dyn IdentitySource>,
        devices: Arc<dyn DevicePostureSource>,
        networks: Arc<dyn NetworkContextSource>,
        classifier: Arc<dyn ResourceClassifier>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            identity,
            devices,
            networks,
            classifier,
            config,
        }
    }

    /// Use one value that implements every collaborator trait
    pub fn from_shared<S>(sources: Arc<S>, config: AggregatorConfig) -> Self
    where
        S: IdentitySource
            + DevicePostureSource
            + NetworkContextSource
            + ResourceClassifier
            + 'static,
    {
        Self::new(
            sources.clone(),
            sources.clone(),
            sources.clone(),
            sources,
            config,
        )
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Gather the context for a request. Never fails and never exceeds the
    /// aggregate timeout.
    pub async fn aggregate(&self, request: &AccessRequest) -> AccessContext {
        let observed_at = Utc::now();
        let per_source = self.config.per_source_timeout();

        let gather = async {
            tokio::join!(
                bounded(
                    SourceKind::Identity,
                    per_source,
                    self.identity.query(&request.principal_id),
                ),
                async {
                    match request.device_id.as_deref() {
                        Some(device_id) => {
                            bounded(
                                SourceKind::DevicePosture,
                                per_source,
                                self.devices.query(device_id),
                            )
                            .await
                        }
                        None => Err(missing(SourceKind::DevicePosture, "request carries no device id")),
                    }
                },
                async {
                    match request.origin.as_deref() {
                        Some(origin) => {
                            bounded(
                                SourceKind::NetworkContext,
                                per_source,
                                self.networks.query(origin),
                            )
                            .await
                        }
                        None => Err(missing(SourceKind::NetworkContext, "request carries no origin")),
                    }
                },
                bounded(
                    SourceKind::ResourceClassifier,
                    per_source,
                    self.classifier.query(&request.resource_id),
                ),
            )
        };

        match tokio::time::timeout(self.config.aggregate_timeout(), gather).await {
            Ok((identity, device, network, sensitivity)) => {
                let context = AccessContext::from_facts(
                    request,
                    recover(identity),
                    recover(device),
                    recover(network),
                    recover(sensitivity),
                    observed_at,
                );
                debug!(
                    request_id = %request.request_id,
                    degraded = context.degraded,
                    "context aggregated"
                );
                context
            }
            Err(_) => {
                let err = EngineError::AggregateTimeout {
                    timeout_ms: self.config.aggregate_timeout_ms,
                };
                warn!(request_id = %request.request_id, "{}", err);
                AccessContext::fully_degraded(request, observed_at)
            }
        }
    }
}

/// Run one collaborator query under the per-source timeout
async fn bounded<T, F>(kind: SourceKind, timeout: Duration, query: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(timeout, query).await {
        Ok(Ok(fact)) => Ok(fact),
        Ok(Err(e)) => Err(missing(kind, e.to_string())),
        Err(_) => Err(missing(kind, format!("timed out after {}ms", timeout.as_millis()))),
    }
}

fn missing(kind: SourceKind, reason: impl Into<String>) -> EngineError {
    EngineError::SourceUnavailable {
        source_kind: kind,
        reason: reason.into(),
    }
}

/// Log a source failure and drop it; the context fills in the fallback
fn recover<T>(result: Result<T, EngineError>) -> Option<T> {
    match result {
        Ok(fact) => Some(fact),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FixtureDevice, FixtureIdentity, FixtureSources};

    fn healthy_sources() -> FixtureSources {
        FixtureSources::new()
            .with_identity(
                "alice",
                FixtureIdentity {
                    roles: ["staff".to_string()].into_iter().collect(),
                    mfa: true,
                    last_strong_auth_secs: Some(120),
                },
            )
            .with_device(
                "laptop-1",
                FixtureDevice {
                    registered: true,
                    compliant: true,
                    healthy_secs_ago: Some(60),
                },
            )
            .with_network("10.0.0.5", NetworkZone::Trusted)
            .with_resource("wiki", Sensitivity::Internal)
    }

    fn request() -> AccessRequest {
        AccessRequest::new("req-1", "alice", "wiki", "read")
            .with_device("laptop-1")
            .with_origin("10.0.0.5")
    }

    #[tokio::test]
    async fn test_full_context() {
        let aggregator =
            ContextAggregator::from_shared(Arc::new(healthy_sources()), AggregatorConfig::default());
        let context = aggregator.aggregate(&request()).await;

        assert!(context.is_fully_verified());
        assert!(context.identity.mfa_satisfied);
        assert!(context.device.compliant);
        assert_eq!(context.network, NetworkZone::Trusted);
        assert_eq!(context.sensitivity, Sensitivity::Internal);
    }

    #[tokio::test]
    async fn test_failed_source_degrades_one_field() {
        let sources = healthy_sources().failing(SourceKind::NetworkContext);
        let aggregator =
            ContextAggregator::from_shared(Arc::new(sources), AggregatorConfig::default());
        let context = aggregator.aggregate(&request()).await;

        assert!(context.degraded);
        assert_eq!(context.network, NetworkZone::Unknown);
        assert_eq!(
            context.degraded_sources.iter().copied().collect::<Vec<_>>(),
            vec![SourceKind::NetworkContext]
        );
        // Other facts survive
        assert!(context.device.compliant);
        assert!(!context.aggregate_timed_out);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let sources =
            healthy_sources().with_latency(SourceKind::DevicePosture, Duration::from_millis(200));
        let config = AggregatorConfig {
            per_source_timeout_ms: 20,
            aggregate_timeout_ms: 500,
        };
        let aggregator = ContextAggregator::from_shared(Arc::new(sources), config);
        let context = aggregator.aggregate(&request()).await;

        assert!(context.degraded);
        assert!(context.degraded_sources.contains(&SourceKind::DevicePosture));
        assert!(!context.device.compliant);
        assert!(!context.device.registered);
    }

    #[tokio::test]
    async fn test_aggregate_timeout_is_fully_degraded() {
        let sources = healthy_sources()
            .with_latency(SourceKind::Identity, Duration::from_millis(300))
            .with_latency(SourceKind::ResourceClassifier, Duration::from_millis(300));
        let config = AggregatorConfig {
            per_source_timeout_ms: 1000,
            aggregate_timeout_ms: 30,
        };
        let aggregator = ContextAggregator::from_shared(Arc::new(sources), config);

        let started = std::time::Instant::now();
        let context = aggregator.aggregate(&request()).await;

        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(context.aggregate_timed_out);
        assert_eq!(context.degraded_sources.len(), SourceKind::all().len());
        assert_eq!(context.sensitivity, Sensitivity::Restricted);
    }

    #[tokio::test]
    async fn test_missing_device_id_is_degraded() {
        let aggregator =
            ContextAggregator::from_shared(Arc::new(healthy_sources()), AggregatorConfig::default());
        let request = AccessRequest::new("req-2", "alice", "wiki", "read").with_origin("10.0.0.5");
        let context = aggregator.aggregate(&request).await;

        assert!(context.degraded);
        assert!(context.degraded_sources.contains(&SourceKind::DevicePosture));
    }

    #[test]
    fn test_conservative_defaults() {
        let request = request();
        let context = AccessContext::from_facts(&request, None, None, None, None, Utc::now());
        assert!(context.identity.roles.is_empty());
        assert!(!context.identity.mfa_satisfied);
        assert_eq!(context.network, NetworkZone::Unknown);
        assert_eq!(context.sensitivity, Sensitivity::Restricted);
        assert!(context.degraded);
    }
}
