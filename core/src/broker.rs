//! Interposes on agent-initiated approval requests. Every request gets
//! exactly one response: synthesized immediately by the policy, carried back
//! from the client, or the configured default action when the deadline
//! lapses. Resolution uses take-and-remove so the timeout-vs-client race can
//! never double-respond.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditAction;
use crate::audit::AuditDecision;
use crate::audit::AuditEntry;
use crate::audit::AuditLog;
use crate::config::ApprovalConfig;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::policy;
use crate::policy::ApprovalAction;
use crate::policy::PolicyDecision;
use crate::util::now_ms;
use cloud_codex_protocol::ir::ApprovalDecision;
use cloud_codex_protocol::ir::ApprovalStatus;
use cloud_codex_protocol::jsonrpc::RequestId;

/// One agent-initiated request, as handed over by the session wiring.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub rpc_id: RequestId,
    pub method: String,
    pub params: Value,
    pub session_id: String,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub item_id: Option<String>,
}

/// What the broker decided, or the receiver to wait on for a manual request.
pub enum ApprovalOutcome {
    Auto {
        approval_id: String,
        decision: ApprovalDecision,
    },
    Pending {
        approval_id: String,
        resolution: oneshot::Receiver<ApprovalResolution>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalResolution {
    pub decision: ApprovalDecision,
    pub accept_settings: Option<Value>,
    pub status: ApprovalStatus,
}

/// Broker-owned record of one outstanding approval.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: String,
    pub rpc_id: RequestId,
    pub session_id: String,
    pub user_id: String,
    pub request: Value,
    pub created_at: i64,
    pub deadline: i64,
}

struct PendingEntry {
    record: PendingApproval,
    action: ApprovalAction,
    thread_id: Option<String>,
    turn_id: Option<String>,
    resolver: oneshot::Sender<ApprovalResolution>,
    timer: AbortHandle,
}

pub struct ApprovalBroker {
    config: ApprovalConfig,
    pending: Mutex<HashMap<String, PendingEntry>>,
    audit: Arc<AuditLog>,
}

impl ApprovalBroker {
    pub fn new(config: ApprovalConfig, audit: Arc<AuditLog>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Mutex::new(HashMap::new()),
            audit,
        })
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Evaluate one agent request. Auto outcomes are already audited and must
    /// be answered by the caller right away; a pending outcome resolves on
    /// the returned receiver within the configured deadline.
    pub fn intake(self: &Arc<Self>, request: ApprovalRequest) -> ApprovalOutcome {
        let approval_id = Uuid::new_v4().to_string();

        let Some(action) = ApprovalAction::from_request(&request.method, &request.params) else {
            warn!(method = %request.method, "unknown agent request method; declining");
            self.audit.record(build_audit(
                &request,
                None,
                AuditDecision::Decline,
                "policy_engine".to_string(),
                Some(format!("unknown approval method: {}", request.method)),
                true,
            ));
            return ApprovalOutcome::Auto {
                approval_id,
                decision: ApprovalDecision::Decline,
            };
        };

        match policy::evaluate(&self.config, &action) {
            PolicyDecision::Accept => {
                self.audit.record(build_audit(
                    &request,
                    Some(&action),
                    AuditDecision::Accept,
                    "policy_engine".to_string(),
                    None,
                    true,
                ));
                ApprovalOutcome::Auto {
                    approval_id,
                    decision: ApprovalDecision::Accept,
                }
            }
            PolicyDecision::Decline => {
                self.audit.record(build_audit(
                    &request,
                    Some(&action),
                    AuditDecision::Decline,
                    "policy_engine".to_string(),
                    None,
                    true,
                ));
                ApprovalOutcome::Auto {
                    approval_id,
                    decision: ApprovalDecision::Decline,
                }
            }
            PolicyDecision::Manual => {
                let (resolver, resolution) = oneshot::channel();
                let created_at = now_ms();
                let deadline = created_at + self.config.timeout_ms as i64;
                let timer = tokio::spawn({
                    let broker = Arc::clone(self);
                    let approval_id = approval_id.clone();
                    async move {
                        tokio::time::sleep(broker.config.timeout()).await;
                        broker.expire(&approval_id);
                    }
                })
                .abort_handle();

                let entry = PendingEntry {
                    record: PendingApproval {
                        approval_id: approval_id.clone(),
                        rpc_id: request.rpc_id.clone(),
                        session_id: request.session_id.clone(),
                        user_id: request.user_id.clone(),
                        request: request.params.clone(),
                        created_at,
                        deadline,
                    },
                    action,
                    thread_id: request.thread_id.clone(),
                    turn_id: request.turn_id.clone(),
                    resolver,
                    timer,
                };
                self.pending
                    .lock()
                    .unwrap()
                    .insert(approval_id.clone(), entry);
                info!(%approval_id, user_id = %request.user_id, "approval pending user decision");
                ApprovalOutcome::Pending {
                    approval_id,
                    resolution,
                }
            }
        }
    }

    /// Resolve a pending approval with the client's decision. Unknown ids and
    /// session mismatches are rejected without touching the entry.
    pub fn respond_from_client(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: ApprovalDecision,
        accept_settings: Option<Value>,
    ) -> Result<()> {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            let Some(entry) = pending.remove(approval_id) else {
                return Err(GatewayErr::UnknownApproval(approval_id.to_string()));
            };
            if entry.record.session_id != session_id {
                pending.insert(approval_id.to_string(), entry);
                return Err(GatewayErr::ApprovalSessionMismatch(approval_id.to_string()));
            }
            entry
        };

        entry.timer.abort();
        self.audit.record(entry_audit(
            &entry,
            decision.into(),
            format!("user_{}", entry.record.user_id),
            None,
            false,
        ));
        let status = match decision {
            ApprovalDecision::Accept => ApprovalStatus::Accepted,
            ApprovalDecision::Decline => ApprovalStatus::Declined,
        };
        let _ = entry.resolver.send(ApprovalResolution {
            decision,
            accept_settings,
            status,
        });
        Ok(())
    }

    fn expire(&self, approval_id: &str) {
        let Some(entry) = self.pending.lock().unwrap().remove(approval_id) else {
            return;
        };
        warn!(%approval_id, "approval deadline lapsed; sending default action");
        self.audit.record(entry_audit(
            &entry,
            AuditDecision::Timeout,
            "timeout".to_string(),
            None,
            false,
        ));
        let _ = entry.resolver.send(ApprovalResolution {
            decision: self.config.default_action,
            accept_settings: None,
            status: ApprovalStatus::Timeout,
        });
    }
}

impl From<ApprovalDecision> for AuditDecision {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Accept => AuditDecision::Accept,
            ApprovalDecision::Decline => AuditDecision::Decline,
        }
    }
}

fn build_audit(
    request: &ApprovalRequest,
    action: Option<&ApprovalAction>,
    decision: AuditDecision,
    approver: String,
    reason: Option<String>,
    auto_approved: bool,
) -> AuditEntry {
    let (audit_action, command, changes) = match action {
        Some(ApprovalAction::CommandExecution { command, .. }) => (
            AuditAction::CommandExecution,
            Some(command.clone()),
            None,
        ),
        Some(ApprovalAction::FileChange { changes }) => (
            AuditAction::FileChange,
            None,
            Some(changes.clone()),
        ),
        None => (AuditAction::Unknown, None, None),
    };
    AuditEntry {
        timestamp: Utc::now(),
        user_id: request.user_id.clone(),
        session_id: request.session_id.clone(),
        thread_id: request.thread_id.clone(),
        turn_id: request.turn_id.clone(),
        action: audit_action,
        command,
        changes,
        decision,
        approver,
        reason,
        auto_approved,
    }
}

fn entry_audit(
    entry: &PendingEntry,
    decision: AuditDecision,
    approver: String,
    reason: Option<String>,
    auto_approved: bool,
) -> AuditEntry {
    let (audit_action, command, changes) = match &entry.action {
        ApprovalAction::CommandExecution { command, .. } => (
            AuditAction::CommandExecution,
            Some(command.clone()),
            None,
        ),
        ApprovalAction::FileChange { changes } => {
            (AuditAction::FileChange, None, Some(changes.clone()))
        }
    };
    AuditEntry {
        timestamp: Utc::now(),
        user_id: entry.record.user_id.clone(),
        session_id: entry.record.session_id.clone(),
        thread_id: entry.thread_id.clone(),
        turn_id: entry.turn_id.clone(),
        action: audit_action,
        command,
        changes,
        decision,
        approver,
        reason,
        auto_approved,
    }
}
