#![allow(clippy::expect_used)]
//! Shared helpers for integration tests: a scripted `/bin/sh` stand-in for
//! the agent subprocess and a channel-backed supervisor tap.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cloud_codex_core::config::GatewayConfig;
use cloud_codex_core::supervisor::AgentCommand;
use cloud_codex_core::supervisor::ExitInfo;
use cloud_codex_core::supervisor::IncomingRequest;
use cloud_codex_core::supervisor::ProcessError;
use cloud_codex_core::supervisor::SupervisorTap;
use cloud_codex_protocol::ir::RawEvent;
use cloud_codex_protocol::ir::RunView;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Write a scripted agent that answers `initialize`, `thread/start`, and
/// `turn/start`, echoing each request's id. `rpc/fail` returns an error
/// response, `emit/stderr` writes a classifiable line to stderr, and
/// `exit/now` terminates with status 3.
pub fn write_fake_agent(dir: &Path) -> PathBuf {
    write_agent_script(dir, "")
}

/// Like [`write_fake_agent`], but `turn/start` also emits a command approval
/// request for `command` before answering. The command must not contain
/// single quotes.
pub fn write_approval_agent(dir: &Path, command: &str, cwd: &str) -> PathBuf {
    let emit = format!(
        r#"      printf '{{"id":101,"method":"item/commandExecution/requestApproval","params":{{"itemId":"i1","threadId":"t1","turnId":"u1","command":"{command}","cwd":"{cwd}"}}}}\n'
"#
    );
    write_agent_script(dir, &emit)
}

fn write_agent_script(dir: &Path, turn_start_extra: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
# Scripted agent stand-in: reads JSON-RPC lines, answers by substring match.
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"id":%s,"result":{{"serverInfo":{{"name":"fake-agent","version":"0.0.0"}}}}}}\n' "$id"
      ;;
    *'"method":"thread/start"'*)
      printf '{{"method":"thread/started","params":{{"threadId":"t1"}}}}\n'
      printf '{{"id":%s,"result":{{"threadId":"t1"}}}}\n' "$id"
      ;;
    *'"method":"turn/start"'*)
      printf '{{"method":"turn/started","params":{{"threadId":"t1","turnId":"u1"}}}}\n'
{turn_start_extra}      printf '{{"id":%s,"result":{{"turnId":"u1"}}}}\n' "$id"
      ;;
    *'"method":"rpc/fail"'*)
      printf '{{"id":%s,"error":{{"code":-32000,"message":"upstream timeout talking to model"}}}}\n' "$id"
      ;;
    *'"method":"emit/stderr"'*)
      echo 'ERROR http 401 Unauthorized: invalid_api_key' >&2
      ;;
    *'"method":"exit/now"'*)
      exit 3
      ;;
  esac
done
"#
    );
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, script).expect("write fake agent script");
    path
}

pub fn agent_command(script: &Path) -> AgentCommand {
    AgentCommand {
        program: "/bin/sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        env: std::collections::HashMap::new(),
    }
}

/// A gateway config pointing at the scripted agent, with a dedicated
/// workspace root.
pub fn test_config(workspace_root: &Path, script: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.workspace_root = workspace_root.to_path_buf();
    config.agent.program = "/bin/sh".to_string();
    config.agent.args = vec![script.to_string_lossy().into_owned()];
    config
}

/// Supervisor tap that forwards every callback onto unbounded channels.
pub struct ChannelTap {
    events: mpsc::UnboundedSender<RawEvent>,
    run_updates: mpsc::UnboundedSender<RunView>,
    requests: mpsc::UnboundedSender<IncomingRequest>,
    process_errors: mpsc::UnboundedSender<ProcessError>,
    exits: mpsc::UnboundedSender<ExitInfo>,
}

pub struct TapStreams {
    pub events: mpsc::UnboundedReceiver<RawEvent>,
    pub run_updates: mpsc::UnboundedReceiver<RunView>,
    pub requests: mpsc::UnboundedReceiver<IncomingRequest>,
    pub process_errors: mpsc::UnboundedReceiver<ProcessError>,
    pub exits: mpsc::UnboundedReceiver<ExitInfo>,
}

pub fn channel_tap() -> (Arc<ChannelTap>, TapStreams) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let (exits_tx, exits_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelTap {
            events: events_tx,
            run_updates: updates_tx,
            requests: requests_tx,
            process_errors: errors_tx,
            exits: exits_tx,
        }),
        TapStreams {
            events: events_rx,
            run_updates: updates_rx,
            requests: requests_rx,
            process_errors: errors_rx,
            exits: exits_rx,
        },
    )
}

impl SupervisorTap for ChannelTap {
    fn on_event(&self, event: &RawEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_run_update(&self, view: &RunView) {
        let _ = self.run_updates.send(view.clone());
    }

    fn on_approval_request(&self, request: IncomingRequest) {
        let _ = self.requests.send(request);
    }

    fn on_process_error(&self, error: &ProcessError) {
        let _ = self.process_errors.send(error.clone());
    }

    fn on_exit(&self, info: &ExitInfo) {
        let _ = self.exits.send(info.clone());
    }
}

/// Receive with a bound so a hung subprocess fails the test instead of the
/// suite.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
        Ok(Some(value)) => value,
        Ok(None) => panic!("{what}: channel closed"),
        Err(_) => panic!("{what}: timed out after {RECV_TIMEOUT:?}"),
    }
}
