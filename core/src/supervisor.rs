//! Owns one agent subprocess: spawn, framed stdio, request/response
//! correlation, raw-event construction, and the IR mapper for its threads.
//! The supervisor is the sole reader of the child's stdout and the sole
//! writer of its stdin; everything it learns is published through the
//! [`SupervisorTap`] capability object handed in at spawn time.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::error::classify_error_summary;
use crate::mapper::RunViewMapper;
use crate::util::now_ms;
use cloud_codex_protocol::ir::ApprovalStatus;
use cloud_codex_protocol::ir::ApprovalView;
use cloud_codex_protocol::ir::INITIALIZE_METHOD;
use cloud_codex_protocol::ir::INITIALIZED_NOTIFICATION_METHOD;
use cloud_codex_protocol::ir::RawEvent;
use cloud_codex_protocol::ir::RunView;
use cloud_codex_protocol::ir::thread_id_from_params;
use cloud_codex_protocol::ir::turn_id_from_params;
use cloud_codex_protocol::jsonrpc::JsonRpcMessage;
use cloud_codex_protocol::jsonrpc::JsonRpcNotification;
use cloud_codex_protocol::jsonrpc::JsonRpcRequest;
use cloud_codex_protocol::jsonrpc::JsonRpcResponse;
use cloud_codex_protocol::jsonrpc::RequestId;
use cloud_codex_protocol::jsonrpc::decode_line;
use cloud_codex_protocol::jsonrpc::encode_line;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How to launch the agent. The child inherits the host environment,
/// extended by `env`.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessErrorSource {
    Stderr,
    Exit,
    Response,
}

/// One classified process-error record. Stderr output alone never tears the
/// session down; the record is only broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessError {
    pub summary: String,
    pub details: String,
    pub source: ProcessErrorSource,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub ts: i64,
}

/// An agent-initiated request. The receiver is responsible for eventually
/// sending a response that echoes `rpc_id`.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub rpc_id: RequestId,
    pub method: String,
    pub params: Value,
    pub event: RawEvent,
}

/// Up-only publication surface. Callbacks run on the supervisor's reader
/// tasks and must not block.
pub trait SupervisorTap: Send + Sync + 'static {
    fn on_event(&self, event: &RawEvent);
    fn on_run_update(&self, view: &RunView);
    fn on_approval_request(&self, request: IncomingRequest);
    fn on_process_error(&self, error: &ProcessError);
    fn on_exit(&self, info: &ExitInfo);
}

type PendingWaiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct ThreadHints {
    last_thread_id: Option<String>,
    last_turn_id: Option<String>,
}

pub struct AgentSupervisor {
    outgoing_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    pending: Mutex<HashMap<i64, PendingWaiter>>,
    next_request_id: AtomicI64,
    next_event_seq: AtomicU64,
    mapper: Mutex<RunViewMapper>,
    hints: Mutex<ThreadHints>,
    tap: Arc<dyn SupervisorTap>,
    request_timeout: Duration,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl AgentSupervisor {
    /// Spawn the agent in `cwd` and start the reader/writer tasks. The caller
    /// must complete the [`initialize`](Self::initialize) handshake before
    /// forwarding user traffic.
    pub async fn spawn(
        command: AgentCommand,
        cwd: &Path,
        request_timeout: Duration,
        tap: Arc<dyn SupervisorTap>,
    ) -> Result<Arc<Self>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(GatewayErr::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayErr::Spawn(std::io::Error::other("child stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayErr::Spawn(std::io::Error::other("child stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayErr::Spawn(std::io::Error::other("child stderr not captured")))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let supervisor = Arc::new(Self {
            outgoing_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            next_event_seq: AtomicU64::new(1),
            mapper: Mutex::new(RunViewMapper::new()),
            hints: Mutex::new(ThreadHints::default()),
            tap,
            request_timeout,
            stop_tx: Mutex::new(Some(stop_tx)),
            closed: AtomicBool::new(false),
        });

        // Writer task: sole owner of the child's stdin.
        tokio::spawn({
            let mut stdin = stdin;
            async move {
                while let Some(message) = outgoing_rx.recv().await {
                    match encode_line(&message) {
                        Ok(json) => {
                            debug!("frame to agent: {json}");
                            if stdin.write_all(json.as_bytes()).await.is_err() {
                                error!("failed to write frame to agent stdin");
                                break;
                            }
                            if stdin.write_all(b"\n").await.is_err() {
                                error!("failed to write newline to agent stdin");
                                break;
                            }
                        }
                        Err(e) => error!("failed to serialize frame: {e}"),
                    }
                }
            }
        });

        // Reader task: sole owner of the child's stdout.
        tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("frame from agent: {line}");
                    let Some(message) = decode_line(&line) else {
                        continue;
                    };
                    supervisor.dispatch_incoming(message);
                }
                debug!("agent stdout reached EOF");
            }
        });

        // Stderr task: every non-empty line becomes a classified record.
        tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    warn!("agent stderr: {line}");
                    supervisor.report_process_error(ProcessErrorSource::Stderr, line);
                }
            }
        });

        // Exit monitor: reaps the child and rejects every pending waiter.
        tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move {
                let mut first_wait: Option<std::io::Result<std::process::ExitStatus>> = None;
                tokio::select! {
                    status = child.wait() => {
                        first_wait = Some(status);
                    }
                    _ = &mut stop_rx => {}
                }
                let stopped = first_wait.is_none();
                let status = match first_wait {
                    Some(status) => status,
                    None => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                supervisor.closed.store(true, Ordering::SeqCst);

                let waiters: Vec<PendingWaiter> = {
                    let mut pending = supervisor.pending.lock().unwrap();
                    pending.drain().map(|(_, waiter)| waiter).collect()
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(GatewayErr::AgentClosed));
                }

                let exit_code = status.ok().and_then(|status| status.code());
                if !stopped && exit_code != Some(0) {
                    let details = match exit_code {
                        Some(code) => format!("agent exited with status {code}"),
                        None => "agent exited without a status code".to_string(),
                    };
                    supervisor.report_process_error(ProcessErrorSource::Exit, details);
                }
                supervisor.tap.on_exit(&ExitInfo {
                    exit_code,
                    ts: now_ms(),
                });
            }
        });

        Ok(supervisor)
    }

    /// `initialize` request followed by the `initialized` notification.
    /// Completion of this handshake gates user traffic.
    pub async fn initialize(&self, client_info: Value) -> Result<Value> {
        let result = self
            .call(INITIALIZE_METHOD, Some(json!({ "clientInfo": client_info })))
            .await?;
        self.notify(INITIALIZED_NOTIFICATION_METHOD, Some(json!({})))?;
        Ok(result)
    }

    /// Send a request and await its response or the deadline. A response
    /// arriving after the deadline is discarded silently.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayErr::AgentClosed);
        }
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so an immediate response cannot be lost.
        self.pending.lock().unwrap().insert(id, tx);

        let request = JsonRpcMessage::Request(JsonRpcRequest {
            id: RequestId::Integer(id),
            method: method.to_string(),
            params,
        });
        if self.outgoing_tx.send(request).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(GatewayErr::AgentClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayErr::AgentClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(GatewayErr::RequestTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcMessage::Notification(JsonRpcNotification {
            method: method.to_string(),
            params,
        });
        self.outgoing_tx
            .send(notification)
            .map_err(|_| GatewayErr::AgentClosed)
    }

    /// Answer an agent-initiated request, echoing its rpc id.
    pub fn respond(&self, rpc_id: RequestId, result: Value) -> Result<()> {
        let response = JsonRpcMessage::Response(JsonRpcResponse {
            id: rpc_id,
            result: Some(result),
            error: None,
        });
        self.outgoing_tx
            .send(response)
            .map_err(|_| GatewayErr::AgentClosed)
    }

    /// Terminate the agent. Double-close is a no-op.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn run_view(&self, thread_id: &str) -> Option<RunView> {
        self.mapper.lock().unwrap().run_view(thread_id).cloned()
    }

    /// Record a broker-issued approval on a step and publish the update.
    pub fn attach_approval(&self, thread_id: &str, item_id: &str, approval: ApprovalView) {
        let view = self
            .mapper
            .lock()
            .unwrap()
            .attach_approval(thread_id, item_id, approval);
        if let Some(view) = view {
            self.tap.on_run_update(&view);
        }
    }

    /// Transition an approval out of `pending` and publish the update.
    pub fn resolve_approval(&self, thread_id: &str, approval_id: &str, status: ApprovalStatus) {
        let view = self
            .mapper
            .lock()
            .unwrap()
            .resolve_approval(thread_id, approval_id, status, now_ms());
        if let Some(view) = view {
            self.tap.on_run_update(&view);
        }
    }

    fn dispatch_incoming(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.dispatch_response(response),
            JsonRpcMessage::Request(request) => {
                let params = request.params.unwrap_or(Value::Null);
                let event = self.build_raw_event(&request.method, &params, Some(request.id.clone()));
                self.tap.on_event(&event);
                // The mapper sees the event before the broker so the step
                // exists by the time an approval is attached to it.
                self.consume_into_mapper(&event);
                self.tap.on_approval_request(IncomingRequest {
                    rpc_id: request.id,
                    method: request.method,
                    params,
                    event,
                });
            }
            JsonRpcMessage::Notification(notification) => {
                let params = notification.params.unwrap_or(Value::Null);
                let event = self.build_raw_event(&notification.method, &params, None);
                self.tap.on_event(&event);
                self.consume_into_mapper(&event);
            }
        }
    }

    fn dispatch_response(&self, response: JsonRpcResponse) {
        let RequestId::Integer(id) = response.id.clone() else {
            warn!("response with string id has no matching pending request");
            return;
        };
        let waiter = self.pending.lock().unwrap().remove(&id);
        let Some(waiter) = waiter else {
            debug!(id, "no pending request for response; dropping");
            return;
        };
        match response.into_outcome() {
            Ok(result) => {
                let _ = waiter.send(Ok(result));
            }
            Err(rpc_error) => {
                let summary =
                    self.report_process_error(ProcessErrorSource::Response, rpc_error.message);
                let _ = waiter.send(Err(GatewayErr::Rpc {
                    code: rpc_error.code,
                    message: summary,
                }));
            }
        }
    }

    /// Broadcast a classified process-error record and, when a run is known,
    /// surface it there as a synthesized system note. Returns the summary.
    fn report_process_error(&self, source: ProcessErrorSource, details: String) -> String {
        let summary = classify_error_summary(&details);
        let (thread_id, turn_id) = self.hint_ids();
        let record = ProcessError {
            summary: summary.clone(),
            details,
            source,
            ts: now_ms(),
            thread_id: thread_id.clone(),
            turn_id,
        };
        self.tap.on_process_error(&record);

        // A response error is already delivered on its rejected waiter; only
        // unsolicited sources become a note on the run.
        if source != ProcessErrorSource::Response {
            if let Some(thread_id) = thread_id {
                let seq = self.next_event_seq.fetch_add(1, Ordering::SeqCst);
                let note_id = format!("note-{seq}");
                let view = self.mapper.lock().unwrap().add_system_note(
                    &thread_id,
                    &note_id,
                    &record.summary,
                    &record.details,
                    record.ts,
                );
                if let Some(view) = view {
                    self.tap.on_run_update(&view);
                }
            }
        }
        summary
    }

    fn consume_into_mapper(&self, event: &RawEvent) {
        let view = self.mapper.lock().unwrap().consume(event);
        if let Some(view) = view {
            self.tap.on_run_update(&view);
        }
    }

    /// Events without explicit thread/turn ids inherit the last ones seen.
    /// A thread change invalidates the inherited turn.
    fn build_raw_event(&self, method: &str, params: &Value, rpc_id: Option<RequestId>) -> RawEvent {
        let seq = self.next_event_seq.fetch_add(1, Ordering::SeqCst);
        let explicit_thread = thread_id_from_params(params);
        let explicit_turn = turn_id_from_params(params);

        let mut hints = self.hints.lock().unwrap();
        if let Some(thread) = &explicit_thread {
            if hints.last_thread_id.as_deref() != Some(thread.as_str()) {
                hints.last_thread_id = Some(thread.clone());
                hints.last_turn_id = None;
            }
        }
        if let Some(turn) = &explicit_turn {
            hints.last_turn_id = Some(turn.clone());
        }
        let thread_id = explicit_thread.or_else(|| hints.last_thread_id.clone());
        let turn_id = explicit_turn.or_else(|| hints.last_turn_id.clone());

        RawEvent {
            id: format!("evt-{seq}"),
            ts: now_ms(),
            thread_id,
            turn_id,
            ty: method.to_string(),
            payload: params.clone(),
            rpc_id,
        }
    }

    fn hint_ids(&self) -> (Option<String>, Option<String>) {
        let hints = self.hints.lock().unwrap();
        (hints.last_thread_id.clone(), hints.last_turn_id.clone())
    }
}
