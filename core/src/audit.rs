//! Append-only audit trail for approval decisions. Persistence is delegated
//! to an external sink; the in-memory log stays queryable by user.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CommandExecution,
    FileChange,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Accept,
    Decline,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<serde_json::Value>,
    pub decision: AuditDecision,
    pub approver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub auto_approved: bool,
}

/// External persistence collaborator. Called synchronously on every record.
pub trait AuditSink: Send + Sync {
    fn persist(&self, entry: &AuditEntry);
}

#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        debug!(
            user_id = %entry.user_id,
            approver = %entry.approver,
            "audit: {:?} {:?}",
            entry.action,
            entry.decision
        );
        if let Some(sink) = &self.sink {
            sink.persist(&entry);
        }
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries_for_user(&self, user_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(user_id: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            session_id: "s1".to_string(),
            thread_id: None,
            turn_id: None,
            action: AuditAction::CommandExecution,
            command: Some("ls".to_string()),
            changes: None,
            decision: AuditDecision::Accept,
            approver: "policy_engine".to_string(),
            reason: None,
            auto_approved: true,
        }
    }

    #[test]
    fn log_is_queryable_by_user() {
        let log = AuditLog::new();
        log.record(entry("u1"));
        log.record(entry("u2"));
        log.record(entry("u1"));
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries_for_user("u1").len(), 2);
        assert_eq!(log.entries_for_user("u3").len(), 0);
    }

    #[test]
    fn sink_sees_every_entry() {
        struct Counting(Mutex<usize>);
        impl AuditSink for Counting {
            fn persist(&self, _entry: &AuditEntry) {
                *self.0.lock().unwrap() += 1;
            }
        }
        let sink = Arc::new(Counting(Mutex::new(0)));
        let log = AuditLog::with_sink(sink.clone());
        log.record(entry("u1"));
        log.record(entry("u1"));
        assert_eq!(*sink.0.lock().unwrap(), 2);
    }
}
