//! Error taxonomy for the decision engine
//!
//! Only `AuditWriteFailed` and `RequestIdConflict` ever reach a caller of the
//! evaluate-access path.
//! Source failures and aggregate timeouts are recovered by degrading the
//! context; they exist as values so they can be logged uniformly.

use crate::session::{SessionEvent, SessionState};
use crate::sources::SourceKind;
use thiserror::Error;

/// Engine-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{source_kind} source unavailable: {reason}")]
    SourceUnavailable { source_kind: SourceKind, reason: String },

    #[error("context aggregation exceeded {timeout_ms}ms; using fully degraded context")]
    AggregateTimeout { timeout_ms: u64 },

    #[error("policy set rejected: {0}")]
    PolicySetInvalid(String),

    #[error("audit write failed: {0}")]
    AuditWriteFailed(String),

    #[error("request id {0} was already used for a different request")]
    RequestIdConflict(String),

    #[error("illegal session transition: {event} in state {from}")]
    IllegalSessionTransition { from: SessionState, event: SessionEvent },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("threat indicator epoch {offered} is not newer than active epoch {current}")]
    StaleThreatEpoch { current: u64, offered: u64 },
}

pub type Result<T> = std::result::Result<T, EngineError>;
