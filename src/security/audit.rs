//! Append-only, bounded audit trail of security-relevant and execution events.
//!
//! Entries are kept in memory (oldest evicted first) and mirrored to
//! `tracing` under the `audit` target. Ordering across concurrent writers
//! follows `timestamp`, not position in the buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::runtime::CommandKind;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionCreated,
    SessionClosed,
    SessionExpired,
    CodeExecution,
    FileOperation,
    ShellCommand,
    PackageInstall,
    SecurityViolation,
    InputValidationFailure,
    RateLimitExceeded,
}

impl AuditEventType {
    pub fn for_command(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Code => AuditEventType::CodeExecution,
            CommandKind::File => AuditEventType::FileOperation,
            CommandKind::Shell => AuditEventType::ShellCommand,
            CommandKind::Package => AuditEventType::PackageInstall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: Option<String>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub description: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        session_id: impl Into<String>,
        event_type: AuditEventType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            user_id: None,
            event_type,
            severity: AuditSeverity::Info,
            description: description.into(),
            success: true,
            error: None,
            duration_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        emit(&entry);
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn for_session(&self, session_id: &str, limit: usize) -> Vec<AuditEntry> {
        self.filtered(|e| e.session_id == session_id, limit)
    }

    pub fn by_event_type(&self, event_type: AuditEventType, limit: usize) -> Vec<AuditEntry> {
        self.filtered(|e| e.event_type == event_type, limit)
    }

    /// Entries of `event_type` for one session, newest `limit`, oldest first.
    pub fn for_session_and_type(
        &self,
        session_id: &str,
        event_type: AuditEventType,
        limit: usize,
    ) -> Vec<AuditEntry> {
        self.filtered(
            |e| e.session_id == session_id && e.event_type == event_type,
            limit,
        )
    }

    pub fn count_by_event_type(&self) -> HashMap<AuditEventType, usize> {
        let mut counts = HashMap::new();
        for entry in self.lock().iter() {
            *counts.entry(entry.event_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn filtered(&self, pred: impl Fn(&AuditEntry) -> bool, limit: usize) -> Vec<AuditEntry> {
        let entries = self.lock();
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .rev()
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn emit(entry: &AuditEntry) {
    match entry.severity {
        AuditSeverity::Info => info!(
            target: "audit",
            session_id = %entry.session_id,
            event = ?entry.event_type,
            success = entry.success,
            duration_ms = ?entry.duration_ms,
            "{}", entry.description
        ),
        AuditSeverity::Warning => warn!(
            target: "audit",
            session_id = %entry.session_id,
            event = ?entry.event_type,
            error = ?entry.error,
            "{}", entry.description
        ),
        AuditSeverity::Error | AuditSeverity::Critical => error!(
            target: "audit",
            session_id = %entry.session_id,
            event = ?entry.event_type,
            severity = ?entry.severity,
            error = ?entry.error,
            "{}", entry.description
        ),
    }
}
