#![cfg(unix)]
#![allow(clippy::expect_used)]
// End-to-end over in-memory pipes: a client connection on one side, the
// scripted /bin/sh agent from core_test_support on the other.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::DuplexStream;
use tokio::io::Lines;

use cloud_codex_core::audit::AuditDecision;
use cloud_codex_core::registry::SessionRegistry;
use cloud_codex_gateway::serve_connection;
use cloud_codex_protocol::frames::ServerFrame;
use cloud_codex_protocol::frames::ServerOp;
use cloud_codex_protocol::ir::COMMAND_APPROVAL_METHOD;
use cloud_codex_protocol::ir::StepStatus;
use core_test_support::test_config;
use core_test_support::write_approval_agent;
use core_test_support::write_fake_agent;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestClient {
    writer: DuplexStream,
    lines: Lines<BufReader<DuplexStream>>,
    seen: Vec<ServerFrame>,
}

impl TestClient {
    async fn connect(registry: Arc<SessionRegistry>, user_id: &str) -> Self {
        let (client_writer, server_reader) = tokio::io::duplex(64 * 1024);
        let (server_writer, client_reader) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(
            registry,
            user_id.to_string(),
            server_reader,
            server_writer,
        ));
        Self {
            writer: client_writer,
            lines: BufReader::new(client_reader).lines(),
            seen: Vec::new(),
        }
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write client frame");
    }

    async fn read_frame(&mut self) -> ServerFrame {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("frame within deadline")
            .expect("readable stream")
            .expect("stream still open");
        let frame: ServerFrame = serde_json::from_str(&line).expect("valid server frame");
        self.seen.push(frame.clone());
        frame
    }

    /// Read frames until one satisfies `pred`; every frame read is recorded
    /// in `seen`.
    async fn read_until(&mut self, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
        loop {
            let frame = self.read_frame().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    async fn read_response(&mut self, request_id: &str) -> Value {
        let frame = self
            .read_until(|frame| {
                matches!(frame.op, ServerOp::Response(_))
                    && frame.request_id.as_deref() == Some(request_id)
            })
            .await;
        let ServerOp::Response(payload) = frame.op else {
            unreachable!();
        };
        payload
    }
}

async fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_handshake_reports_the_session() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let mut client = TestClient::connect(Arc::clone(&registry), "u1").await;
    let frame = client.read_frame().await;
    let ServerOp::Response(payload) = frame.op else {
        panic!("expected the connected response first");
    };
    assert_eq!(payload["status"], "connected");
    let session_id = payload["sessionId"].as_str().expect("session id");
    assert!(registry.get(session_id).is_ok());

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_commands_are_approved_without_asking_the_client() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_approval_agent(dir.path(), "ls -la", "/home/u");
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let mut client = TestClient::connect(Arc::clone(&registry), "u1").await;
    client.read_frame().await; // connected

    client
        .send(json!({"type": "thread/start", "payload": {}, "requestId": "r1"}))
        .await;
    let result = client.read_response("r1").await;
    assert_eq!(result["threadId"], "t1");

    client
        .send(json!({"type": "turn/start", "payload": {}, "requestId": "r2"}))
        .await;
    client.read_response("r2").await;

    let registry_for_audit = Arc::clone(&registry);
    wait_for("the policy decision to be audited", move || {
        !registry_for_audit.audit().entries_for_user("u1").is_empty()
    })
    .await;

    let audit = registry.audit().entries_for_user("u1");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].decision, AuditDecision::Accept);
    assert_eq!(audit[0].approver, "policy_engine");
    assert!(audit[0].auto_approved);
    assert_eq!(audit[0].command.as_deref(), Some("ls -la"));
    assert_eq!(registry.broker().pending_count(), 0);

    assert!(
        !client
            .seen
            .iter()
            .any(|frame| matches!(frame.op, ServerOp::ApprovalRequest(_))),
        "auto-approved commands must not reach the client"
    );

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_approvals_round_trip_through_the_client() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_approval_agent(dir.path(), "rm -rf /", "/home/u");
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let mut client = TestClient::connect(Arc::clone(&registry), "u1").await;
    client.read_frame().await; // connected

    client
        .send(json!({"type": "thread/start", "payload": {}, "requestId": "r1"}))
        .await;
    client.read_response("r1").await;
    client
        .send(json!({"type": "turn/start", "payload": {}, "requestId": "r2"}))
        .await;

    let frame = client
        .read_until(|frame| matches!(frame.op, ServerOp::ApprovalRequest(_)))
        .await;
    let ServerOp::ApprovalRequest(payload) = frame.op else {
        unreachable!();
    };
    assert_eq!(payload["command"], "rm -rf /");
    assert_eq!(payload["method"], COMMAND_APPROVAL_METHOD);
    let approval_id = payload["approvalId"].as_str().expect("approval id").to_string();

    client
        .send(json!({
            "type": "approval/respond",
            "payload": {"approvalId": approval_id, "decision": "decline"},
            "requestId": "r3"
        }))
        .await;
    let result = client.read_response("r3").await;
    assert_eq!(result["status"], "ok");

    // The step the approval was parked on ends up declined.
    let frame = client
        .read_until(|frame| match &frame.op {
            ServerOp::IrUpdate(view) => view
                .steps
                .iter()
                .any(|step| step.step_id == "i1" && step.status == StepStatus::Declined),
            _ => false,
        })
        .await;
    let ServerOp::IrUpdate(view) = frame.op else {
        unreachable!();
    };
    let step = view.steps.iter().find(|s| s.step_id == "i1").expect("step");
    assert_eq!(
        step.approval.as_ref().map(|a| a.approval_id.as_str()),
        Some(approval_id.as_str())
    );

    let audit = registry.audit().entries_for_user("u1");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].decision, AuditDecision::Decline);
    assert_eq!(audit[0].approver, "user_u1");
    assert!(!audit[0].auto_approved);
    assert_eq!(registry.broker().pending_count(), 0);

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_client_frames_get_an_error_frame() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let mut client = TestClient::connect(Arc::clone(&registry), "u1").await;
    client.read_frame().await; // connected

    client.writer.write_all(b"{not json\n").await.expect("write");
    let frame = client
        .read_until(|frame| matches!(frame.op, ServerOp::Error(_)))
        .await;
    let ServerOp::Error(payload) = frame.op else {
        unreachable!();
    };
    assert!(payload.message.contains("malformed frame"));

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_approval_ids_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let mut client = TestClient::connect(Arc::clone(&registry), "u1").await;
    client.read_frame().await; // connected

    client
        .send(json!({
            "type": "approval/respond",
            "payload": {"approvalId": "nope", "decision": "accept"},
            "requestId": "r1"
        }))
        .await;
    let frame = client
        .read_until(|frame| frame.request_id.as_deref() == Some("r1"))
        .await;
    assert!(matches!(frame.op, ServerOp::Error(_)));

    registry.shutdown().await;
}
