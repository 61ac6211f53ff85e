//! Ordered approval rules for agent-initiated actions. Commands can be
//! auto-approved by a built-in read-only allow list, by configured command
//! prefixes, or by configured working-directory globs; file changes always go
//! to the user.

use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;
use wildmatch::WildMatch;

use crate::config::ApprovalConfig;
use cloud_codex_protocol::ir::COMMAND_APPROVAL_METHOD;
use cloud_codex_protocol::ir::FILE_CHANGE_APPROVAL_METHOD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Decline,
    Manual,
}

/// The action extracted from an approval request's params.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalAction {
    CommandExecution { command: String, cwd: PathBuf },
    FileChange { changes: Value },
}

impl ApprovalAction {
    pub fn from_request(method: &str, params: &Value) -> Option<Self> {
        match method {
            COMMAND_APPROVAL_METHOD => Some(ApprovalAction::CommandExecution {
                command: params
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                cwd: PathBuf::from(
                    params.get("cwd").and_then(Value::as_str).unwrap_or_default(),
                ),
            }),
            FILE_CHANGE_APPROVAL_METHOD => Some(ApprovalAction::FileChange {
                changes: params.get("changes").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        }
    }
}

pub fn evaluate(config: &ApprovalConfig, action: &ApprovalAction) -> PolicyDecision {
    match action {
        ApprovalAction::CommandExecution { command, cwd } => {
            evaluate_command(config, command, cwd)
        }
        ApprovalAction::FileChange { .. } => PolicyDecision::Manual,
    }
}

fn evaluate_command(config: &ApprovalConfig, command: &str, cwd: &Path) -> PolicyDecision {
    if is_read_only_command(command) {
        return PolicyDecision::Accept;
    }
    if config
        .auto_approve
        .commands
        .iter()
        .any(|prefix| command.starts_with(prefix.as_str()))
    {
        return PolicyDecision::Accept;
    }
    let cwd = cwd.to_string_lossy();
    if config
        .auto_approve
        .paths
        .iter()
        .any(|glob| WildMatch::new(glob).matches(&cwd))
    {
        return PolicyDecision::Accept;
    }
    PolicyDecision::Manual
}

/// Commands whose leading token (or leading two tokens) only read state.
#[rustfmt::skip]
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "grep", "find", "head", "tail", "less", "more", "pwd",
    "echo", "date", "whoami", "which",
    "git log", "git status", "git diff", "git show",
    "npm list", "yarn list",
];

/// A read-only command must also carry no output redirection.
pub fn is_read_only_command(command: &str) -> bool {
    if command.contains('>') {
        return false;
    }
    let Some(tokens) = shlex::split(command) else {
        return false;
    };
    let Some(first) = tokens.first() else {
        return false;
    };
    if READ_ONLY_COMMANDS.contains(&first.as_str()) {
        return true;
    }
    match tokens.get(1) {
        Some(second) => {
            let pair = format!("{first} {second}");
            READ_ONLY_COMMANDS.contains(&pair.as_str())
        }
        None => false,
    }
}
