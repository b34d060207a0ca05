//! Gatekeeper - zero trust access decisions
//!
//! Every request to use a protected resource is decided from scratch:
//! who is asking, from which device, from which network, for what, and
//! whether any of it is currently known to be hostile.
//!
//! The evaluate-access path:
//! - Context aggregation: four collaborators queried concurrently, each
//!   bounded by a timeout. Missing facts become conservative stand-ins and
//!   mark the context degraded.
//! - Risk scoring: weighted, capped sub-scores from configuration.
//! - Policy evaluation: deny first, then challenge, then allow, then deny
//!   by default.
//! - Audit: the decision is durably recorded before it is returned.
//!
//! Sessions that were granted access keep being re-evaluated in the
//! background and are downgraded when the picture changes.

pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod level;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod risk;
pub mod session;
pub mod sources;
pub mod threat;

pub use audit::{AuditLog, AuditRecord, AuditSink, MemoryAuditSink};
pub use config::EngineConfig;
pub use context::{AccessContext, AccessRequest, ContextAggregator, NetworkZone};
pub use engine::AccessEngine;
pub use error::{EngineError, Result};
pub use evaluator::{Decision, PolicyEngine, Reason};
pub use level::{AssuranceLevel, Sensitivity};
pub use monitor::ContinuousAuthMonitor;
pub use policy::{Effect, Policy, PolicySet, PolicyStore};
pub use risk::{RiskEngine, RiskScore};
pub use session::{Session, SessionManager, SessionState};
pub use threat::{ThreatIndicators, ThreatIntelStore};
