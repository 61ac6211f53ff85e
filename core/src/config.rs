//! Gateway configuration, loaded from a TOML file with per-field defaults.
//! Option names follow the wire dialect (camelCase), so a config file reads:
//!
//! ```toml
//! workspaceRoot = "/srv/cloud-codex/workspaces"
//! idleTimeoutMs = 1800000
//!
//! [agent]
//! program = "codex"
//!
//! [approval.autoApprove]
//! commands = ["ls", "git status"]
//! paths = ["/tmp/*"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayErr;
use crate::error::Result;
use cloud_codex_protocol::ir::ApprovalDecision;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Base directory for per-user workspaces.
    pub workspace_root: PathBuf,
    /// Session idle reap threshold.
    pub idle_timeout_ms: u64,
    /// Idle sweep period.
    pub sweep_interval_ms: u64,
    /// Outgoing RPC deadline.
    pub request_timeout_ms: u64,
    pub agent: AgentConfig,
    pub approval: ApprovalConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            idle_timeout_ms: 1_800_000,
            sweep_interval_ms: 60_000,
            request_timeout_ms: 60_000,
            agent: AgentConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| GatewayErr::Config(e.to_string()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How to launch the downstream agent. The subprocess inherits the host
/// environment, extended by `env`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalConfig {
    /// Pending-approval deadline.
    pub timeout_ms: u64,
    /// Decision sent when the deadline lapses.
    pub default_action: ApprovalDecision,
    pub auto_approve: AutoApproveConfig,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            default_action: ApprovalDecision::Decline,
            auto_approve: AutoApproveConfig::default(),
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoApproveConfig {
    /// Command prefixes approved without asking.
    pub commands: Vec<String>,
    /// Working-directory globs approved without asking.
    pub paths: Vec<String>,
}

impl Default for AutoApproveConfig {
    fn default() -> Self {
        Self {
            commands: ["ls", "cat", "grep", "git status", "git log"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            paths: vec!["/tmp/*".to_string()],
        }
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloud-codex")
        .join("workspaces")
}
