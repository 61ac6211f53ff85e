//! Per-user session registry: at most one live session per user, each owning
//! a supervisor bound to its own workspace directory. Supervisor taps are
//! re-broadcast as registry events tagged with the session and user, and a
//! periodic sweep reaps idle sessions.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::audit::AuditSink;
use crate::broker;
use crate::broker::ApprovalBroker;
use crate::broker::ApprovalOutcome;
use crate::config::GatewayConfig;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::supervisor::AgentCommand;
use crate::supervisor::AgentSupervisor;
use crate::supervisor::ExitInfo;
use crate::supervisor::IncomingRequest;
use crate::supervisor::ProcessError;
use crate::supervisor::SupervisorTap;
use crate::util::now_ms;
use cloud_codex_protocol::ir::ApprovalDecision;
use cloud_codex_protocol::ir::ApprovalStatus;
use cloud_codex_protocol::ir::ApprovalView;
use cloud_codex_protocol::ir::RawEvent;
use cloud_codex_protocol::ir::RunView;

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Closed,
}

/// The per-user binding of client traffic to one agent subprocess and its
/// workspace. The registry owns the session; the session owns its supervisor.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub supervisor: Arc<AgentSupervisor>,
    pub created_at: i64,
    pub working_directory: PathBuf,
    state: Mutex<SessionState>,
    last_active_at: AtomicI64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .field("working_directory", &self.working_directory)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn last_active_at(&self) -> i64 {
        self.last_active_at.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_active_at.store(now_ms(), Ordering::Relaxed);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Closed is final; turn events arriving afterwards cannot reopen it.
    fn set_state_if_open(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap();
        if *current != SessionState::Closed {
            *current = state;
        }
    }
}

/// A supervisor tap, re-broadcast with session/user attribution.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub session_id: String,
    pub user_id: String,
    pub kind: RegistryEventKind,
}

#[derive(Debug, Clone)]
pub enum RegistryEventKind {
    SessionEvent(RawEvent),
    IrUpdate(RunView),
    ApprovalRequest(Value),
    SessionError(ProcessError),
    Exit(ExitInfo),
}

pub struct SessionRegistry {
    config: GatewayConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    user_index: RwLock<HashMap<String, String>>,
    creation_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    broker: Arc<ApprovalBroker>,
    events_tx: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        Self::with_audit(config, Arc::new(AuditLog::new()))
    }

    pub fn with_audit_sink(config: GatewayConfig, sink: Arc<dyn AuditSink>) -> Arc<Self> {
        Self::with_audit(config, Arc::new(AuditLog::with_sink(sink)))
    }

    fn with_audit(config: GatewayConfig, audit: Arc<AuditLog>) -> Arc<Self> {
        let broker = ApprovalBroker::new(config.approval.clone(), audit);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            creation_guards: Mutex::new(HashMap::new()),
            broker,
            events_tx,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.broker.audit()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    /// Return the user's live session, creating one if necessary. Creation
    /// serializes per user, so two concurrent calls for the same user observe
    /// the same session.
    pub async fn get_or_create(self: &Arc<Self>, user_id: &str) -> Result<Arc<Session>> {
        let guard = {
            let mut guards = self.creation_guards.lock().unwrap();
            Arc::clone(
                guards
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = guard.lock().await;

        if let Some(session) = self.session_for_user(user_id) {
            if session.state() != SessionState::Closed {
                return Ok(session);
            }
            // The agent died underneath this session; replace the remnant.
            self.destroy(&session.id).await?;
        }
        self.create_session(user_id).await
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayErr::SessionNotFound(session_id.to_string()))
    }

    pub fn session_for_user(&self, user_id: &str) -> Option<Arc<Session>> {
        let session_id = self.user_index.read().unwrap().get(user_id).cloned()?;
        self.sessions.read().unwrap().get(&session_id).cloned()
    }

    async fn create_session(self: &Arc<Self>, user_id: &str) -> Result<Arc<Session>> {
        let session_id = Uuid::new_v4().to_string();
        let working_directory = self.config.workspace_root.join(user_id);
        tokio::fs::create_dir_all(&working_directory).await?;

        let tap = Arc::new(SessionTap {
            registry: Arc::downgrade(self),
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
        });
        let command = AgentCommand {
            program: self.config.agent.program.clone(),
            args: self.config.agent.args.clone(),
            env: self.config.agent.env.clone(),
        };
        let supervisor = AgentSupervisor::spawn(
            command,
            &working_directory,
            self.config.request_timeout(),
            tap,
        )
        .await?;

        let now = now_ms();
        let session = Arc::new(Session {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            supervisor: Arc::clone(&supervisor),
            created_at: now,
            working_directory,
            state: Mutex::new(SessionState::Initializing),
            last_active_at: AtomicI64::new(now),
        });
        // Registered before the handshake so tap callbacks can resolve it.
        self.sessions
            .write()
            .unwrap()
            .insert(session_id.clone(), Arc::clone(&session));
        self.user_index
            .write()
            .unwrap()
            .insert(user_id.to_string(), session_id.clone());

        let client_info = json!({
            "name": "cloud-codex-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        });
        match supervisor.initialize(client_info).await {
            Ok(_) => {
                session.set_state(SessionState::Ready);
                info!(%session_id, user_id, "session ready");
                Ok(session)
            }
            Err(e) => {
                session.set_state(SessionState::Closed);
                supervisor.stop();
                self.sessions.write().unwrap().remove(&session_id);
                self.user_index
                    .write()
                    .unwrap()
                    .retain(|_, id| *id != session_id);
                Err(GatewayErr::Handshake(e.to_string()))
            }
        }
    }

    /// Stop the session's agent, drop the registry entry, and remove its
    /// workspace (best effort).
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().unwrap();
            let Some(session) = sessions.remove(session_id) else {
                return Err(GatewayErr::SessionNotFound(session_id.to_string()));
            };
            self.user_index
                .write()
                .unwrap()
                .retain(|_, id| *id != session_id);
            session
        };
        session.set_state(SessionState::Closed);
        session.supervisor.stop();
        if let Err(e) = tokio::fs::remove_dir_all(&session.working_directory).await {
            warn!(session_id, "failed to remove workspace: {e}");
        }
        info!(session_id, user_id = %session.user_id, "session destroyed");
        Ok(())
    }

    /// Destroy sessions idle past the configured threshold. Busy sessions
    /// are skipped.
    pub async fn sweep_idle(&self) {
        let now = now_ms();
        let idle_ms = self.config.idle_timeout_ms as i64;
        let stale: Vec<String> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| {
                session.state() != SessionState::Busy
                    && now - session.last_active_at() > idle_ms
            })
            .map(|session| session.id.clone())
            .collect();
        for session_id in stale {
            info!(%session_id, "reaping idle session");
            if let Err(e) = self.destroy(&session_id).await {
                warn!(%session_id, "idle reap failed: {e}");
            }
        }
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_idle().await;
            }
        })
    }

    /// Graceful teardown: stop every agent. Workspaces are left on disk.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().unwrap();
            self.user_index.write().unwrap().clear();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.set_state(SessionState::Closed);
            session.supervisor.stop();
        }
    }

    fn publish(&self, session_id: &str, user_id: &str, kind: RegistryEventKind) {
        let _ = self.events_tx.send(RegistryEvent {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            kind,
        });
    }
}

struct SessionTap {
    registry: Weak<SessionRegistry>,
    session_id: String,
    user_id: String,
}

impl SupervisorTap for SessionTap {
    fn on_event(&self, event: &RawEvent) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(session) = registry.get(&self.session_id) {
            session.touch();
            match event.ty.as_str() {
                "turn/started" => session.set_state_if_open(SessionState::Busy),
                "turn/completed" => session.set_state_if_open(SessionState::Ready),
                _ => {}
            }
        }
        registry.publish(
            &self.session_id,
            &self.user_id,
            RegistryEventKind::SessionEvent(event.clone()),
        );
    }

    fn on_run_update(&self, view: &RunView) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(session) = registry.get(&self.session_id) {
            session.touch();
        }
        registry.publish(
            &self.session_id,
            &self.user_id,
            RegistryEventKind::IrUpdate(view.clone()),
        );
    }

    fn on_approval_request(&self, request: IncomingRequest) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(session) = registry.get(&self.session_id) else {
            return;
        };
        session.touch();
        tokio::spawn(handle_agent_request(
            registry,
            session,
            self.user_id.clone(),
            request,
        ));
    }

    fn on_process_error(&self, error: &ProcessError) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(session) = registry.get(&self.session_id) {
            session.touch();
        }
        registry.publish(
            &self.session_id,
            &self.user_id,
            RegistryEventKind::SessionError(error.clone()),
        );
    }

    fn on_exit(&self, info: &ExitInfo) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Ok(session) = registry.get(&self.session_id) {
            session.set_state(SessionState::Closed);
        }
        registry.publish(
            &self.session_id,
            &self.user_id,
            RegistryEventKind::Exit(info.clone()),
        );
    }
}

/// Route one agent-initiated request through the broker and guarantee the
/// agent a response: immediately for policy decisions, or once the user (or
/// the deadline) resolves a pending approval.
async fn handle_agent_request(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    user_id: String,
    request: IncomingRequest,
) {
    let supervisor = Arc::clone(&session.supervisor);
    let thread_id = request.event.thread_id.clone();
    let turn_id = request.event.turn_id.clone();
    let item_id = request
        .params
        .get("itemId")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let reason = request
        .params
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let risk = request.params.get("risk").cloned().filter(|v| !v.is_null());

    let approval_request = broker::ApprovalRequest {
        rpc_id: request.rpc_id.clone(),
        method: request.method.clone(),
        params: request.params.clone(),
        session_id: session.id.clone(),
        user_id: user_id.clone(),
        thread_id: thread_id.clone(),
        turn_id,
        item_id: item_id.clone(),
    };

    match registry.broker.intake(approval_request) {
        ApprovalOutcome::Auto {
            approval_id,
            decision,
        } => {
            if let Err(e) = supervisor.respond(request.rpc_id, json!({ "decision": decision })) {
                warn!("failed to answer agent request: {e}");
            }
            if let (Some(thread), Some(item)) = (&thread_id, &item_id) {
                let status = match decision {
                    ApprovalDecision::Accept => ApprovalStatus::Accepted,
                    ApprovalDecision::Decline => ApprovalStatus::Declined,
                };
                supervisor.attach_approval(
                    thread,
                    item,
                    ApprovalView {
                        approval_id,
                        status,
                        reason,
                        risk,
                    },
                );
            }
        }
        ApprovalOutcome::Pending {
            approval_id,
            resolution,
        } => {
            if let (Some(thread), Some(item)) = (&thread_id, &item_id) {
                supervisor.attach_approval(
                    thread,
                    item,
                    ApprovalView {
                        approval_id: approval_id.clone(),
                        status: ApprovalStatus::Pending,
                        reason,
                        risk,
                    },
                );
            }

            let mut payload = match request.params {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            payload.insert(
                "approvalId".to_string(),
                Value::String(approval_id.clone()),
            );
            payload.insert("method".to_string(), Value::String(request.method));
            registry.publish(
                &session.id,
                &user_id,
                RegistryEventKind::ApprovalRequest(Value::Object(payload)),
            );

            match resolution.await {
                Ok(resolved) => {
                    let mut result = json!({ "decision": resolved.decision });
                    if let Some(settings) = resolved.accept_settings {
                        if let Some(map) = result.as_object_mut() {
                            map.insert("acceptSettings".to_string(), settings);
                        }
                    }
                    if let Err(e) = supervisor.respond(request.rpc_id, result) {
                        warn!("failed to answer agent request: {e}");
                    }
                    if let Some(thread) = &thread_id {
                        supervisor.resolve_approval(thread, &approval_id, resolved.status);
                    }
                }
                Err(_) => {
                    // Broker dropped without resolving; decline to keep the
                    // one-response guarantee.
                    let _ = supervisor.respond(
                        request.rpc_id,
                        json!({ "decision": ApprovalDecision::Decline }),
                    );
                }
            }
        }
    }
}
