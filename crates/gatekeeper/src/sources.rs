//! External collaborators the engine consumes
//!
//! Each collaborator sits behind a narrow capability trait:
//! `query(id) -> Fact | SourceError`. The aggregator does not care how a
//! fact is produced, only that the query can be bounded by a timeout.
//!
//! `FixtureSources` implements all four traits from a YAML file and backs
//! the CLI and the test suites.

use crate::config::window;
use crate::context::{DeviceFacts, IdentityFacts, NetworkZone};
use crate::level::Sensitivity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Which collaborator a fact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Identity,
    DevicePosture,
    NetworkContext,
    ResourceClassifier,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Identity => "identity",
            SourceKind::DevicePosture => "device_posture",
            SourceKind::NetworkContext => "network_context",
            SourceKind::ResourceClassifier => "resource_classifier",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            SourceKind::Identity,
            SourceKind::DevicePosture,
            SourceKind::NetworkContext,
            SourceKind::ResourceClassifier,
        ]
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by a collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("no facts known for {0}")]
    NotFound(String),
}

/// Identity source: authenticates principals, reports roles and MFA state
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn query(&self, principal_id: &str) -> Result<IdentityFacts, SourceError>;
}

/// Device posture source: registration and compliance state of a device
#[async_trait]
pub trait DevicePostureSource: Send + Sync {
    async fn query(&self, device_id: &str) -> Result<DeviceFacts, SourceError>;
}

/// Network context source: classifies where a request came from
#[async_trait]
pub trait NetworkContextSource: Send + Sync {
    async fn query(&self, origin: &str) -> Result<NetworkZone, SourceError>;
}

/// Resource classifier: sensitivity tier of a resource
#[async_trait]
pub trait ResourceClassifier: Send + Sync {
    async fn query(&self, resource_id: &str) -> Result<Sensitivity, SourceError>;
}

/// Identity entry in a fixture file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureIdentity {
    #[serde(default)]
    pub roles: BTreeSet<String>,

    #[serde(default)]
    pub mfa: bool,

    /// Seconds since the last strong authentication
    #[serde(default)]
    pub last_strong_auth_secs: Option<u64>,
}

/// Device entry in a fixture file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureDevice {
    #[serde(default)]
    pub registered: bool,

    #[serde(default)]
    pub compliant: bool,

    /// Seconds since the device was last reported healthy
    #[serde(default)]
    pub healthy_secs_ago: Option<u64>,
}

/// Static collaborator answers, loadable from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSources {
    #[serde(default)]
    pub identities: HashMap<String, FixtureIdentity>,

    #[serde(default)]
    pub devices: HashMap<String, FixtureDevice>,

    /// Origin (IP or network id) to zone
    #[serde(default)]
    pub networks: HashMap<String, NetworkZone>,

    /// Resource id to sensitivity
    #[serde(default)]
    pub resources: HashMap<String, Sensitivity>,

    /// Artificial latency applied to every query, per source
    #[serde(default)]
    pub latency_ms: HashMap<SourceKind, u64>,

    /// Sources that always report themselves unavailable
    #[serde(default)]
    pub failing: HashSet<SourceKind>,
}

impl FixtureSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load fixtures from a YAML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures from {:?}", path))?;
        let fixtures: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse fixtures from {:?}", path))?;
        Ok(fixtures)
    }

    pub fn with_identity(mut self, principal_id: &str, identity: FixtureIdentity) -> Self {
        self.identities.insert(principal_id.to_string(), identity);
        self
    }

    pub fn with_device(mut self, device_id: &str, device: FixtureDevice) -> Self {
        self.devices.insert(device_id.to_string(), device);
        self
    }

    pub fn with_network(mut self, origin: &str, zone: NetworkZone) -> Self {
        self.networks.insert(origin.to_string(), zone);
        self
    }

    pub fn with_resource(mut self, resource_id: &str, sensitivity: Sensitivity) -> Self {
        self.resources.insert(resource_id.to_string(), sensitivity);
        self
    }

    pub fn with_latency(mut self, kind: SourceKind, latency: Duration) -> Self {
        self.latency_ms.insert(kind, latency.as_millis() as u64);
        self
    }

    pub fn failing(mut self, kind: SourceKind) -> Self {
        self.failing.insert(kind);
        self
    }

    /// Simulate latency and forced failure for one source
    async fn respond(&self, kind: SourceKind) -> Result<(), SourceError> {
        if let Some(ms) = self.latency_ms.get(&kind) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.failing.contains(&kind) {
            return Err(SourceError::Unavailable(format!("{} fixture marked failing", kind)));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentitySource for FixtureSources {
    async fn query(&self, principal_id: &str) -> Result<IdentityFacts, SourceError> {
        self.respond(SourceKind::Identity).await?;
        let entry = self
            .identities
            .get(principal_id)
            .ok_or_else(|| SourceError::NotFound(principal_id.to_string()))?;
        Ok(IdentityFacts {
            roles: entry.roles.clone(),
            mfa_satisfied: entry.mfa,
            since_strong_auth_secs: entry.last_strong_auth_secs,
        })
    }
}

#[async_trait]
impl DevicePostureSource for FixtureSources {
    async fn query(&self, device_id: &str) -> Result<DeviceFacts, SourceError> {
        self.respond(SourceKind::DevicePosture).await?;
        let entry = self
            .devices
            .get(device_id)
            .ok_or_else(|| SourceError::NotFound(device_id.to_string()))?;
        Ok(DeviceFacts {
            registered: entry.registered,
            compliant: entry.compliant,
            last_seen_healthy: entry
                .healthy_secs_ago
                .map(|secs| Utc::now() - window(secs)),
        })
    }
}

#[async_trait]
impl NetworkContextSource for FixtureSources {
    async fn query(&self, origin: &str) -> Result<NetworkZone, SourceError> {
        self.respond(SourceKind::NetworkContext).await?;
        self.networks
            .get(origin)
            .copied()
            .ok_or_else(|| SourceError::NotFound(origin.to_string()))
    }
}

#[async_trait]
impl ResourceClassifier for FixtureSources {
    async fn query(&self, resource_id: &str) -> Result<Sensitivity, SourceError> {
        self.respond(SourceKind::ResourceClassifier).await?;
        self.resources
            .get(resource_id)
            .copied()
            .ok_or_else(|| SourceError::NotFound(resource_id.to_string()))
    }
}
