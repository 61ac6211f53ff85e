//! Per-connection translation between client frames and the core runtime.
//! One adapter serves one authenticated user: it resolves the session on
//! connect, forwards thread/turn verbs to the agent, routes approval
//! responses to the broker, and pumps the user's registry events back out.

use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::warn;

use cloud_codex_core::Result;
use cloud_codex_core::registry::RegistryEvent;
use cloud_codex_core::registry::RegistryEventKind;
use cloud_codex_core::registry::Session;
use cloud_codex_core::registry::SessionRegistry;
use cloud_codex_protocol::frames::ApprovalRespondPayload;
use cloud_codex_protocol::frames::ClientFrame;
use cloud_codex_protocol::frames::ClientOp;
use cloud_codex_protocol::frames::ServerFrame;
use cloud_codex_protocol::ir::THREAD_RESUME_METHOD;
use cloud_codex_protocol::ir::THREAD_START_METHOD;
use cloud_codex_protocol::ir::TURN_INTERRUPT_METHOD;
use cloud_codex_protocol::ir::TURN_START_METHOD;

pub struct ClientGatewayAdapter {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    outgoing: mpsc::Sender<ServerFrame>,
    pump: JoinHandle<()>,
}

impl ClientGatewayAdapter {
    /// Bind the connection to the user's session (creating it if needed) and
    /// acknowledge with the connected response frame.
    pub async fn connect(
        registry: Arc<SessionRegistry>,
        user_id: String,
        outgoing: mpsc::Sender<ServerFrame>,
    ) -> Result<Self> {
        let session = registry.get_or_create(&user_id).await?;
        let _ = outgoing
            .send(ServerFrame::response(
                None,
                json!({ "status": "connected", "sessionId": session.id }),
            ))
            .await;

        let pump = tokio::spawn(pump_registry_events(
            registry.subscribe(),
            user_id,
            outgoing.clone(),
        ));

        Ok(Self {
            registry,
            session,
            outgoing,
            pump,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn process_frame(&self, frame: ClientFrame) {
        let request_id = frame.request_id;
        match frame.op {
            ClientOp::ThreadStart(params) => {
                self.forward_call(THREAD_START_METHOD, params, request_id)
                    .await;
            }
            ClientOp::ThreadResume(params) => {
                self.forward_call(THREAD_RESUME_METHOD, params, request_id)
                    .await;
            }
            ClientOp::TurnStart(params) => {
                self.forward_call(TURN_START_METHOD, params, request_id).await;
            }
            ClientOp::TurnInterrupt(params) => {
                self.forward_call(TURN_INTERRUPT_METHOD, params, request_id)
                    .await;
            }
            ClientOp::ApprovalRespond(payload) => {
                self.respond_approval(payload, request_id).await;
            }
        }
    }

    /// Stop pumping registry events for this connection.
    pub fn close(&self) {
        self.pump.abort();
    }

    async fn forward_call(&self, method: &str, params: Value, request_id: Option<String>) {
        match self.session.supervisor.call(method, Some(params)).await {
            Ok(result) => self.send(ServerFrame::response(request_id, result)).await,
            Err(e) => {
                error!("agent call `{method}` failed: {e}");
                self.send(ServerFrame::error(request_id, e.to_string())).await;
            }
        }
    }

    async fn respond_approval(
        &self,
        payload: ApprovalRespondPayload,
        request_id: Option<String>,
    ) {
        match self.registry.broker().respond_from_client(
            &self.session.id,
            &payload.approval_id,
            payload.decision,
            payload.accept_settings,
        ) {
            Ok(()) => {
                self.send(ServerFrame::response(request_id, json!({ "status": "ok" })))
                    .await;
            }
            Err(e) => {
                error!("approval response dropped: {e}");
                self.send(ServerFrame::error(request_id, e.to_string())).await;
            }
        }
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outgoing.send(frame).await.is_err() {
            warn!("client connection gone; dropping outbound frame");
        }
    }
}

impl Drop for ClientGatewayAdapter {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_registry_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    user_id: String,
    outgoing: mpsc::Sender<ServerFrame>,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.user_id == user_id => {
                if outgoing.send(frame_for(event)).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "client event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn frame_for(event: RegistryEvent) -> ServerFrame {
    match event.kind {
        RegistryEventKind::SessionEvent(raw) => {
            let params = (!raw.payload.is_null()).then_some(raw.payload);
            ServerFrame::event(raw.ty, params)
        }
        RegistryEventKind::IrUpdate(view) => ServerFrame::ir_update(view),
        RegistryEventKind::ApprovalRequest(payload) => ServerFrame::approval_request(payload),
        RegistryEventKind::SessionError(process_error) => ServerFrame::error_with_details(
            None,
            process_error.summary.clone(),
            serde_json::to_value(&process_error).unwrap_or(Value::Null),
        ),
        RegistryEventKind::Exit(info) => ServerFrame::event(
            "session/exit".to_string(),
            serde_json::to_value(&info).ok(),
        ),
    }
}
