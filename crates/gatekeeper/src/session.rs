//! Session lifecycle
//!
//! A session moves through a closed set of transitions:
//!
//! ```text
//! Unauthenticated --submit_credentials--> Authenticating
//! Authenticating  --primary_auth-------> Authenticated
//! Authenticated   --step_up------------> Elevated
//! Authenticated   --downgrade----------> Degraded
//! Elevated        --downgrade----------> Degraded
//! Degraded        --step_up------------> Elevated
//! Degraded        --reauth-------------> Authenticated
//! any live state  --terminate----------> Terminated
//! ```
//!
//! Anything else is rejected and leaves the session untouched. Terminated is
//! absorbing; terminated sessions are dropped from the registry.

use crate::config::MonitorConfig;
use crate::context::AccessRequest;
use crate::error::{EngineError, Result};
use crate::evaluator::Decision;
use crate::level::AssuranceLevel;
use crate::policy::Effect;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Elevated,
    Degraded,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Elevated => "elevated",
            SessionState::Degraded => "degraded",
            SessionState::Terminated => "terminated",
        }
    }

    /// States that hold granted access and are periodically re-evaluated
    pub fn is_monitored(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Elevated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Revoked,
    IdleTimeout,
    LifetimeExceeded,
    Logout,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationCause::Revoked => "revoked",
            TerminationCause::IdleTimeout => "idle_timeout",
            TerminationCause::LifetimeExceeded => "lifetime_exceeded",
            TerminationCause::Logout => "logout",
        };
        write!(f, "{}", s)
    }
}

/// Input to the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    SubmitCredentials,
    PrimaryAuthSucceeded { mfa: bool },
    StepUpSucceeded,
    ReevaluationDowngrade,
    ReauthSucceeded { mfa: bool },
    Terminate(TerminationCause),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::SubmitCredentials => write!(f, "submit_credentials"),
            SessionEvent::PrimaryAuthSucceeded { mfa } => write!(f, "primary_auth(mfa={})", mfa),
            SessionEvent::StepUpSucceeded => write!(f, "step_up"),
            SessionEvent::ReevaluationDowngrade => write!(f, "reevaluation_downgrade"),
            SessionEvent::ReauthSucceeded { mfa } => write!(f, "reauth(mfa={})", mfa),
            SessionEvent::Terminate(cause) => write!(f, "terminate({})", cause),
        }
    }
}

impl SessionEvent {
    /// Events the principal causes. Only these count as session activity.
    pub fn is_principal_driven(&self) -> bool {
        match self {
            SessionEvent::SubmitCredentials
            | SessionEvent::PrimaryAuthSucceeded { .. }
            | SessionEvent::StepUpSucceeded
            | SessionEvent::ReauthSucceeded { .. } => true,
            SessionEvent::Terminate(cause) => *cause == TerminationCause::Logout,
            SessionEvent::ReevaluationDowngrade => false,
        }
    }
}

/// The transition table. `None` means the event is illegal in that state.
pub fn next_state(from: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::Terminated, _) => None,
        (_, E::Terminate(_)) => Some(S::Terminated),
        (S::Unauthenticated, E::SubmitCredentials) => Some(S::Authenticating),
        (S::Authenticating, E::PrimaryAuthSucceeded { .. }) => Some(S::Authenticated),
        (S::Authenticated, E::StepUpSucceeded) => Some(S::Elevated),
        (S::Authenticated | S::Elevated, E::ReevaluationDowngrade) => Some(S::Degraded),
        (S::Degraded, E::StepUpSucceeded) => Some(S::Elevated),
        (S::Degraded, E::ReauthSucceeded { .. }) => Some(S::Authenticated),
        _ => None,
    }
}

/// Whether a re-evaluation outcome falls below the trust a session holds
pub fn outcome_below_trust(decision: &Decision, trust: AssuranceLevel) -> bool {
    match decision.effect {
        Effect::Deny => true,
        Effect::Challenge => decision
            .required_assurance
            .is_some_and(|required| !trust.satisfies(required)),
        Effect::Allow => false,
    }
}

/// A monitored session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: String,

    pub principal_id: String,
    pub device_id: Option<String>,
    pub origin: Option<String>,

    /// Resource and action the session was granted
    pub resource_id: String,
    pub action: String,

    /// Assurance the principal has demonstrated
    pub trust_level: AssuranceLevel,

    pub state: SessionState,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_reevaluated_at: Option<DateTime<Utc>>,

    /// Number of re-evaluations run so far
    pub reevaluations: u64,

    /// Bumped on every transition. A re-evaluation started under an older
    /// generation is discarded.
    pub generation: u64,

    pub termination: Option<TerminationCause>,

    /// Details of the decision that caused the last downgrade
    pub downgrade_reason: Option<String>,
}

impl Session {
    /// Create a new, unauthenticated session bound to a request
    pub fn new(id: String, request: &AccessRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            principal_id: request.principal_id.clone(),
            device_id: request.device_id.clone(),
            origin: request.origin.clone(),
            resource_id: request.resource_id.clone(),
            action: request.action.clone(),
            trust_level: AssuranceLevel::None,
            state: SessionState::Unauthenticated,
            created_at: now,
            last_activity: now,
            last_reevaluated_at: None,
            reevaluations: 0,
            generation: 0,
            termination: None,
            downgrade_reason: None,
        }
    }

    /// Apply one event, or reject it without changing anything
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState> {
        let from = self.state;
        let Some(to) = next_state(from, event) else {
            let err = EngineError::IllegalSessionTransition { from, event };
            warn!(session_id = %self.id, "{}", err);
            return Err(err);
        };

        match event {
            SessionEvent::PrimaryAuthSucceeded { mfa } | SessionEvent::ReauthSucceeded { mfa } => {
                self.trust_level = AssuranceLevel::from_primary_auth(mfa);
                self.downgrade_reason = None;
            }
            SessionEvent::StepUpSucceeded => {
                self.trust_level = AssuranceLevel::StepUp;
                self.downgrade_reason = None;
            }
            SessionEvent::Terminate(cause) => self.termination = Some(cause),
            SessionEvent::SubmitCredentials | SessionEvent::ReevaluationDowngrade => {}
        }

        self.state = to;
        self.generation += 1;
        if event.is_principal_driven() {
            self.last_activity = Utc::now();
        }
        info!(
            session_id = %self.id,
            principal = %self.principal_id,
            from = %from,
            to = %to,
            trust = %self.trust_level,
            "session transition"
        );
        Ok(to)
    }

    /// Request used to re-evaluate this session's access
    pub fn reevaluation_request(&self) -> AccessRequest {
        AccessRequest {
            request_id: format!("{}:reeval:{}", self.id, self.reevaluations),
            principal_id: self.principal_id.clone(),
            resource_id: self.resource_id.clone(),
            action: self.action.clone(),
            device_id: self.device_id.clone(),
            origin: self.origin.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Termination cause if the session has outlived its limits
    pub fn expiry(
        &self,
        now: DateTime<Utc>,
        idle_timeout: chrono::Duration,
        max_lifetime: chrono::Duration,
    ) -> Option<TerminationCause> {
        if now - self.created_at >= max_lifetime {
            Some(TerminationCause::LifetimeExceeded)
        } else if now - self.last_activity >= idle_timeout {
            Some(TerminationCause::IdleTimeout)
        } else {
            None
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }
}

/// Registry of live sessions. Each session sits behind its own lock, so
/// sessions never contend with each other.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    config: MonitorConfig,
}

impl SessionManager {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Register an unauthenticated session for a request
    pub fn start(&self, request: &AccessRequest) -> Session {
        let session = Session::new(generate_session_id(), request);
        self.sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        session
    }

    /// Start a session and run it through primary authentication
    pub async fn establish(&self, request: &AccessRequest, mfa: bool) -> Result<Session> {
        let session = self.start(request);
        self.apply(&session.id, SessionEvent::SubmitCredentials).await?;
        self.apply(&session.id, SessionEvent::PrimaryAuthSucceeded { mfa })
            .await?;
        self.get(&session.id)
            .await
            .ok_or_else(|| EngineError::SessionNotFound(session.id.clone()))
    }

    /// The lock guarding one session
    pub fn handle(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Apply an event to a session. Terminated sessions leave the registry.
    pub async fn apply(&self, id: &str, event: SessionEvent) -> Result<SessionState> {
        let handle = self
            .handle(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        let state = handle.lock().await.apply(event)?;
        if state == SessionState::Terminated {
            self.sessions.remove(id);
        }
        Ok(state)
    }

    pub async fn submit_credentials(&self, id: &str) -> Result<SessionState> {
        self.apply(id, SessionEvent::SubmitCredentials).await
    }

    pub async fn complete_primary_auth(&self, id: &str, mfa: bool) -> Result<SessionState> {
        self.apply(id, SessionEvent::PrimaryAuthSucceeded { mfa }).await
    }

    pub async fn complete_step_up(&self, id: &str) -> Result<SessionState> {
        self.apply(id, SessionEvent::StepUpSucceeded).await
    }

    pub async fn reauthenticate(&self, id: &str, mfa: bool) -> Result<SessionState> {
        self.apply(id, SessionEvent::ReauthSucceeded { mfa }).await
    }

    pub async fn terminate(&self, id: &str, cause: TerminationCause) -> Result<SessionState> {
        self.apply(id, SessionEvent::Terminate(cause)).await
    }

    /// Explicit revocation
    pub async fn revoke(&self, id: &str) -> Result<SessionState> {
        self.terminate(id, TerminationCause::Revoked).await
    }

    /// End every session of a principal; returns how many ended
    pub async fn logout(&self, principal_id: &str) -> usize {
        let mut ended = 0;
        for (id, handle) in self.entries() {
            let owned = handle.lock().await.principal_id == principal_id;
            if !owned {
                continue;
            }
            if self.terminate(&id, TerminationCause::Logout).await.is_ok() {
                ended += 1;
            }
        }
        ended
    }

    /// Record activity on a session
    pub async fn touch(&self, id: &str) -> Result<()> {
        let handle = self
            .handle(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        handle.lock().await.last_activity = Utc::now();
        Ok(())
    }

    /// Copy of a session's current state
    pub async fn get(&self, id: &str) -> Option<Session> {
        let handle = self.handle(id)?;
        let session = handle.lock().await.clone();
        Some(session)
    }

    /// All live sessions, most recently active first
    pub async fn list(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for (_, handle) in self.entries() {
            sessions.push(handle.lock().await.clone());
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Terminate sessions past their idle timeout or maximum lifetime
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<(String, TerminationCause)> {
        let idle = self.config.idle_timeout();
        let lifetime = self.config.max_lifetime();
        let mut expired = Vec::new();

        for (id, handle) in self.entries() {
            let cause = handle.lock().await.expiry(now, idle, lifetime);
            if let Some(cause) = cause {
                if self.terminate(&id, cause).await.is_ok() {
                    expired.push((id, cause));
                }
            }
        }
        expired
    }

    /// Snapshot of the registry so no map guard is held across an await
    fn entries(&self) -> Vec<(String, Arc<Mutex<Session>>)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// Generate a unique session ID
fn generate_session_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    format!("ses_{:012x}{:04x}", nanos & 0xFFFF_FFFF_FFFF, seq & 0xFFFF)
}
