//! Decision audit trail
//!
//! Every decision is appended to an audit sink before it is returned. A sink
//! acknowledges only once the record is durable, so a decision the caller
//! sees always has a record behind it.
//!
//! Storage: ~/.local/share/gatekeeper/audit/decisions.log (JSON lines)

use crate::context::AccessContext;
use crate::evaluator::{Decision, Reason};
use crate::policy::Effect;
use crate::risk::{RiskFactor, RiskScore};
use crate::sources::SourceKind;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gatekeeper_core::Paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

/// Failure to persist an audit record
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("audit sink rejected the record: {0}")]
    Rejected(String),
}

/// A single audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the record was written
    pub recorded_at: DateTime<Utc>,

    pub principal_id: String,
    pub resource_id: String,
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Set when the decision came from a session re-evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub decision: Decision,

    /// Factors behind the risk score
    #[serde(default)]
    pub risk_factors: Vec<RiskFactor>,

    /// Sources whose facts were substituted
    #[serde(default)]
    pub degraded_sources: BTreeSet<SourceKind>,
}

impl AuditRecord {
    /// Create from a decision and the inputs that produced it
    pub fn new(decision: &Decision, context: &AccessContext, risk: &RiskScore) -> Self {
        Self {
            recorded_at: Utc::now(),
            principal_id: context.principal_id.clone(),
            resource_id: context.resource_id.clone(),
            action: context.action.clone(),
            device_id: context.device_id.clone(),
            origin: context.origin.clone(),
            session_id: None,
            decision: decision.clone(),
            risk_factors: risk.factors.clone(),
            degraded_sources: context.degraded_sources.clone(),
        }
    }

    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.decision.request_id
    }
}

/// Append-only destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record. Returns only once the record is durable.
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Audit log manager backed by a JSON lines file
pub struct AuditLog {
    log_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    /// Create a new audit log at the default location
    pub fn new() -> Self {
        Self::with_path(Paths::new().audit_log())
    }

    /// Create with custom path
    pub fn with_path(log_path: PathBuf) -> Self {
        Self {
            log_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Append a record and sync it to disk
    pub fn log(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        write_line(&self.log_path, &self.write_lock, &line)
    }

    /// Query recent entries
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<AuditRecord>> {
        self.query(AuditQuery::default().limit(limit))
    }

    /// Query entries for a principal
    pub fn for_principal(&self, principal_id: &str) -> anyhow::Result<Vec<AuditRecord>> {
        self.query(AuditQuery::default().principal(principal_id))
    }

    /// Query denied entries
    pub fn denied(&self) -> anyhow::Result<Vec<AuditRecord>> {
        self.query(AuditQuery::default().effect(Effect::Deny))
    }

    /// Query with custom filter
    pub fn query(&self, query: AuditQuery) -> anyhow::Result<Vec<AuditRecord>> {
        use anyhow::Context;

        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .with_context(|| format!("Failed to open audit log at {:?}", self.log_path))?;
        let reader = BufReader::new(file);

        let mut records: Vec<AuditRecord> = reader
            .lines()
            .filter_map(|line| line.ok().and_then(|l| serde_json::from_str(&l).ok()))
            .filter(|record: &AuditRecord| query.matches(record))
            .collect();

        // Most recent first
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));

        if let Some(limit) = query.limit {
            records.truncate(limit);
        }

        Ok(records)
    }

    /// Drop records older than the retention window.
    ///
    /// Lines that do not parse are kept. The surviving lines go to a sibling
    /// file which is synced and then renamed over the log, so a crash leaves
    /// either the old log or the new one.
    pub fn cleanup(&self, retention_days: u32) -> anyhow::Result<usize> {
        if !self.log_path.exists() {
            return Ok(0);
        }

        let threshold = Utc::now() - Duration::days(i64::from(retention_days));
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit write lock poisoned"))?;

        let reader = BufReader::new(File::open(&self.log_path)?);
        let mut kept: Vec<String> = Vec::new();
        let mut removed = 0;
        let mut unreadable = 0;

        for line in reader.lines() {
            let line = line?;
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) if record.recorded_at < threshold => removed += 1,
                Ok(_) => kept.push(line),
                Err(_) => {
                    unreadable += 1;
                    kept.push(line);
                }
            }
        }

        if unreadable > 0 {
            warn!(
                path = %self.log_path.display(),
                unreadable,
                "audit log has lines that are not records; keeping them"
            );
        }

        if removed > 0 {
            let mut tmp_name = self.log_path.as_os_str().to_owned();
            tmp_name.push(".tmp");
            let tmp_path = PathBuf::from(tmp_name);

            let mut file = File::create(&tmp_path)?;
            for line in kept {
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
            drop(file);

            std::fs::rename(&tmp_path, &self.log_path)?;
            if let Some(dir) = self.log_path.parent() {
                if let Ok(dir) = File::open(dir) {
                    let _ = dir.sync_all();
                }
            }
        }

        Ok(removed)
    }

    /// Get statistics
    pub fn stats(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<AuditStats> {
        let query = match since {
            Some(since) => AuditQuery::default().since(since),
            None => AuditQuery::default(),
        };

        let mut stats = AuditStats::default();
        for record in self.query(query)? {
            stats.total += 1;
            match record.decision.effect {
                Effect::Allow => stats.allowed += 1,
                Effect::Deny => stats.denied += 1,
                Effect::Challenge => stats.challenged += 1,
            }
            if record.decision.degraded {
                stats.degraded += 1;
            }
            if record.decision.reason == Reason::DefaultDeny {
                stats.default_denies += 1;
            }
            if record.session_id.is_some() {
                stats.reevaluations += 1;
            }
        }

        Ok(stats)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        let path = self.log_path.clone();
        let lock = self.write_lock.clone();

        tokio::task::spawn_blocking(move || write_line(&path, &lock, &line))
            .await
            .map_err(|e| AuditError::Io(std::io::Error::other(e)))?
    }
}

/// Append one line and wait for it to reach the disk
fn write_line(path: &Path, lock: &Mutex<()>, line: &str) -> Result<(), AuditError> {
    let _guard = lock
        .lock()
        .map_err(|_| AuditError::Rejected("audit write lock poisoned".to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// In-memory sink, for tests and embedding
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records written for one request id
    pub fn count_for(&self, request_id: &str) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|rec| rec.request_id() == request_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Rejected("sink marked failing".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| AuditError::Rejected("memory sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}

/// Query parameters for audit log
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    principal_id: Option<String>,
    resource_id: Option<String>,
    session_id: Option<String>,
    effect: Option<Effect>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl AuditQuery {
    /// Filter by principal
    pub fn principal(mut self, principal_id: &str) -> Self {
        self.principal_id = Some(principal_id.to_string());
        self
    }

    /// Filter by resource
    pub fn resource(mut self, resource_id: &str) -> Self {
        self.resource_id = Some(resource_id.to_string());
        self
    }

    /// Filter by session
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Filter by effect
    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Filter by time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref principal) = self.principal_id {
            if record.principal_id != *principal {
                return false;
            }
        }

        if let Some(ref resource) = self.resource_id {
            if record.resource_id != *resource {
                return false;
            }
        }

        if let Some(ref session) = self.session_id {
            if record.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }

        if let Some(effect) = self.effect {
            if record.decision.effect != effect {
                return false;
            }
        }

        if let Some(since) = self.since {
            if record.recorded_at < since {
                return false;
            }
        }

        true
    }
}

/// Audit statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub challenged: usize,
    pub degraded: usize,
    pub default_denies: usize,
    pub reevaluations: usize,
}

impl AuditStats {
    /// Share of decisions that were allowed, in percent
    pub fn allow_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.allowed as f64) / (self.total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AccessRequest;
    use crate::policy::PolicySet;
    use crate::risk::RiskEngine;
    use tempfile::tempdir;

    fn record(request_id: &str, principal: &str, risk: u32) -> AuditRecord {
        let request = AccessRequest::new(request_id, principal, "wiki", "read");
        let context = AccessContext::from_facts(&request, None, None, None, None, Utc::now());
        let risk = RiskEngine::default().with_value(risk);
        let decision = crate::evaluator::decide(&PolicySet::baseline(), &request, &context, &risk);
        AuditRecord::new(&decision, &context, &risk)
    }

    #[test]
    fn test_audit_log() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("audit").join("decisions.log"));

        log.log(&record("req-1", "alice", 90)).unwrap();

        let records = log.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id(), "req-1");
        assert_eq!(records[0].decision.effect, Effect::Deny);
        assert_eq!(records[0].degraded_sources.len(), 4);
    }

    #[tokio::test]
    async fn test_async_append_is_durable() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("decisions.log"));

        log.append(&record("req-1", "alice", 40)).await.unwrap();
        log.append(&record("req-2", "bob", 90)).await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_audit_query() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("decisions.log"));

        for i in 0..5 {
            let principal = if i % 2 == 0 { "alice" } else { "bob" };
            let risk = if i % 2 == 0 { 40 } else { 90 };
            log.log(&record(&format!("req-{}", i), principal, risk)).unwrap();
        }
        log.log(&record("req-s", "alice", 40).for_session("ses_1")).unwrap();

        let alice = log.for_principal("alice").unwrap();
        assert_eq!(alice.len(), 4);

        let denied = log.denied().unwrap();
        assert_eq!(denied.len(), 2);

        let session = log.query(AuditQuery::default().session("ses_1")).unwrap();
        assert_eq!(session.len(), 1);

        let stats = log.stats(None).unwrap();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.challenged, 4);
        assert_eq!(stats.reevaluations, 1);
        assert_eq!(stats.allow_rate(), 0.0);
    }

    #[test]
    fn test_cleanup_keeps_recent() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("decisions.log"));

        let mut old = record("req-old", "alice", 40);
        old.recorded_at = Utc::now() - Duration::days(200);
        log.log(&old).unwrap();
        log.log(&record("req-new", "alice", 40)).unwrap();

        assert_eq!(log.cleanup(90).unwrap(), 1);
        let remaining = log.recent(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id(), "req-new");
    }

    #[test]
    fn test_cleanup_keeps_unreadable_lines() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("decisions.log"));

        let mut old = record("req-old", "alice", 40);
        old.recorded_at = Utc::now() - Duration::days(200);
        log.log(&old).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
            writeln!(file, "{{\"recorded_at\": \"2024-01-").unwrap();
        }
        log.log(&record("req-new", "alice", 40)).unwrap();

        assert_eq!(log.cleanup(90).unwrap(), 1);

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("{\"recorded_at\": \"2024-01-"));
        assert_eq!(log.recent(10).unwrap()[0].request_id(), "req-new");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_failure_toggle() {
        let sink = MemoryAuditSink::new();
        sink.append(&record("req-1", "alice", 40)).await.unwrap();

        sink.set_failing(true);
        assert!(sink.append(&record("req-2", "alice", 40)).await.is_err());

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.count_for("req-1"), 1);
        assert_eq!(sink.count_for("req-2"), 0);
    }
}
