//! Threat intelligence store
//!
//! Indicators of compromise are published as immutable snapshots. A refresh
//! builds a complete new set and swaps it in whole; readers hold an `Arc` to
//! whichever snapshot was current when they looked and never block the
//! writer. Subscribers are woken on every publication, which is how the
//! session monitor learns about new indicators.

use crate::context::AccessContext;
use crate::error::{EngineError, Result};
use crate::sources::SourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kind of identifier an indicator refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Principal,
    Device,
    Network,
}

/// An identifier from a context that appears in the indicator set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreatMatch {
    pub kind: IndicatorKind,
    pub value: String,
}

/// One epoch of indicators of compromise
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatIndicators {
    epoch: u64,

    #[serde(default)]
    principals: BTreeSet<String>,

    #[serde(default)]
    devices: BTreeSet<String>,

    #[serde(default)]
    networks: BTreeSet<String>,
}

impl ThreatIndicators {
    /// Start collecting indicators for a new epoch
    pub fn builder(epoch: u64) -> ThreatIndicatorsBuilder {
        ThreatIndicatorsBuilder {
            indicators: ThreatIndicators {
                epoch,
                ..Default::default()
            },
        }
    }

    /// Load an indicator set from a YAML or JSON file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read threat indicators from {:?}", path))?;
        let indicators: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse threat indicators from {:?}", path))?;
        Ok(indicators)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.principals.len() + self.devices.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_principal_flagged(&self, principal_id: &str) -> bool {
        self.principals.contains(principal_id)
    }

    pub fn is_device_flagged(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }

    pub fn is_network_flagged(&self, network: &str) -> bool {
        self.networks.contains(network)
    }

    /// Every identifier in the context that is currently flagged
    pub fn matches(&self, context: &AccessContext) -> Vec<ThreatMatch> {
        let mut found = Vec::new();
        if self.is_principal_flagged(&context.principal_id) {
            found.push(ThreatMatch {
                kind: IndicatorKind::Principal,
                value: context.principal_id.clone(),
            });
        }
        if let Some(device) = context.device_id.as_deref() {
            if self.is_device_flagged(device) {
                found.push(ThreatMatch {
                    kind: IndicatorKind::Device,
                    value: device.to_string(),
                });
            }
        }
        if let Some(origin) = context.origin.as_deref() {
            if self.is_network_flagged(origin) {
                found.push(ThreatMatch {
                    kind: IndicatorKind::Network,
                    value: origin.to_string(),
                });
            }
        }
        found
    }

    /// Whether a session's principal or device is flagged
    pub fn intersects(&self, principal_id: &str, device_id: Option<&str>) -> bool {
        self.is_principal_flagged(principal_id)
            || device_id.is_some_and(|d| self.is_device_flagged(d))
    }
}

/// Accumulates indicators before publication. Once built, a set is frozen.
#[derive(Debug, Clone)]
pub struct ThreatIndicatorsBuilder {
    indicators: ThreatIndicators,
}

impl ThreatIndicatorsBuilder {
    pub fn principal(mut self, id: impl Into<String>) -> Self {
        self.indicators.principals.insert(id.into());
        self
    }

    pub fn device(mut self, id: impl Into<String>) -> Self {
        self.indicators.devices.insert(id.into());
        self
    }

    pub fn network(mut self, id: impl Into<String>) -> Self {
        self.indicators.networks.insert(id.into());
        self
    }

    pub fn build(self) -> ThreatIndicators {
        self.indicators
    }
}

/// Process-wide holder of the active indicator snapshot
pub struct ThreatIntelStore {
    tx: watch::Sender<Arc<ThreatIndicators>>,
}

impl ThreatIntelStore {
    /// Empty store at epoch 0
    pub fn new() -> Self {
        Self::with_indicators(ThreatIndicators::default())
    }

    pub fn with_indicators(initial: ThreatIndicators) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Atomically replace the active snapshot.
    ///
    /// The new epoch must be strictly newer than the active one; a stale
    /// offer is rejected and the active snapshot stays in place.
    pub fn refresh(&self, next: ThreatIndicators) -> Result<u64> {
        let next = Arc::new(next);
        let mut outcome = Ok(next.epoch);

        self.tx.send_if_modified(|active| {
            if next.epoch <= active.epoch {
                outcome = Err(EngineError::StaleThreatEpoch {
                    current: active.epoch,
                    offered: next.epoch,
                });
                false
            } else {
                *active = next.clone();
                true
            }
        });

        match &outcome {
            Ok(epoch) => info!(epoch, indicators = next.len(), "threat snapshot published"),
            Err(e) => warn!("{}", e),
        }
        outcome
    }

    /// The snapshot active right now; safe to hold indefinitely
    pub fn current_snapshot(&self) -> Arc<ThreatIndicators> {
        self.tx.borrow().clone()
    }

    pub fn current_epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    /// Receiver woken on every publication
    pub fn subscribe(&self) -> watch::Receiver<Arc<ThreatIndicators>> {
        self.tx.subscribe()
    }
}

impl Default for ThreatIntelStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull-style threat intelligence feed delivering whole replacement sets
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    async fn fetch(&self) -> std::result::Result<ThreatIndicators, SourceError>;
}

/// Feed backed by an indicator file that an external process rewrites
pub struct FileThreatFeed {
    path: PathBuf,
}

impl FileThreatFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ThreatFeed for FileThreatFeed {
    async fn fetch(&self) -> std::result::Result<ThreatIndicators, SourceError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || ThreatIndicators::load_from(&path))
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .map_err(|e| SourceError::Unavailable(format!("{:#}", e)))
    }
}

/// Periodically pull the feed and publish newer epochs
pub fn spawn_refresher(
    store: Arc<ThreatIntelStore>,
    feed: Arc<dyn ThreatFeed>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match feed.fetch().await {
                Ok(indicators) => {
                    if indicators.epoch() == store.current_epoch() {
                        debug!(epoch = indicators.epoch(), "threat feed unchanged");
                        continue;
                    }
                    // Stale epochs are logged by refresh and leave the store as is
                    let _ = store.refresh(indicators);
                }
                Err(e) => warn!("threat feed fetch failed, keeping current snapshot: {}", e),
            }
        }
    })
}
