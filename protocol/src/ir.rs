//! Normalized run-view model projected from the agent's raw event stream.
//!
//! A `RawEvent` is the supervisor's record of one incoming request or
//! notification. The mapper folds those into per-thread `RunView`s; every
//! type here serializes with the camelCase field names of the wire dialect.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::jsonrpc::RequestId;

/// Methods the gateway issues to the agent.
pub const INITIALIZE_METHOD: &str = "initialize";
pub const INITIALIZED_NOTIFICATION_METHOD: &str = "initialized";
pub const THREAD_START_METHOD: &str = "thread/start";
pub const THREAD_RESUME_METHOD: &str = "thread/resume";
pub const TURN_START_METHOD: &str = "turn/start";
pub const TURN_INTERRUPT_METHOD: &str = "turn/interrupt";

/// Agent-initiated requests that require a response from the gateway.
pub const COMMAND_APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";
pub const FILE_CHANGE_APPROVAL_METHOD: &str = "item/fileChange/requestApproval";

/// One incoming request or notification, as appended to the supervisor's raw
/// log. Ids are monotonic per supervisor; `ts` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(rename = "type")]
    pub ty: String,
    pub payload: serde_json::Value,
    /// Set when the source frame was a request; the eventual response to the
    /// agent must echo this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_id: Option<RequestId>,
}

/// Thread id extraction order for well-known payload shapes.
pub fn thread_id_from_params(params: &serde_json::Value) -> Option<String> {
    params
        .get("threadId")
        .and_then(serde_json::Value::as_str)
        .or_else(|| {
            params
                .get("turn")
                .and_then(|turn| turn.get("threadId"))
                .and_then(serde_json::Value::as_str)
        })
        .or_else(|| {
            params
                .get("thread")
                .and_then(|thread| thread.get("id"))
                .and_then(serde_json::Value::as_str)
        })
        .map(str::to_owned)
}

/// Turn id extraction order for well-known payload shapes.
pub fn turn_id_from_params(params: &serde_json::Value) -> Option<String> {
    params
        .get("turnId")
        .and_then(serde_json::Value::as_str)
        .or_else(|| {
            params
                .get("turn")
                .and_then(|turn| turn.get("id"))
                .and_then(serde_json::Value::as_str)
        })
        .map(str::to_owned)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RunStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Declined,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Declined
        )
    }
}

/// Closed set of step kinds. Unknown item types map to `SystemNote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StepKind {
    UserMessage,
    AssistantMessage,
    Reasoning,
    CommandExecution,
    FileChange,
    McpToolCall,
    CollabToolCall,
    WebSearch,
    ImageView,
    ReviewMode,
    Compacted,
    SystemNote,
}

impl StepKind {
    pub fn from_item_type(item_type: &str) -> StepKind {
        match item_type {
            "userMessage" => StepKind::UserMessage,
            "agentMessage" | "assistantMessage" => StepKind::AssistantMessage,
            "reasoning" => StepKind::Reasoning,
            "commandExecution" => StepKind::CommandExecution,
            "fileChange" => StepKind::FileChange,
            "mcpToolCall" => StepKind::McpToolCall,
            "collabToolCall" => StepKind::CollabToolCall,
            "webSearch" => StepKind::WebSearch,
            "imageView" => StepKind::ImageView,
            "reviewMode" => StepKind::ReviewMode,
            "compacted" => StepKind::Compacted,
            _ => StepKind::SystemNote,
        }
    }
}

/// Decision carried in responses to the agent and in client frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ApprovalDecision {
    Accept,
    #[default]
    Decline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
    Timeout,
}

/// Present on a step only when the agent asked for human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    pub approval_id: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStepView {
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub status: String,
}

/// One prior version of the plan, kept in `PlanView::history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub steps: Vec<PlanStepView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub steps: Vec<PlanStepView>,
    /// Prior plans, oldest first. Never loses a version.
    #[serde(default)]
    pub history: Vec<PlanVersion>,
}

impl PlanView {
    pub fn as_version(&self) -> PlanVersion {
        PlanVersion {
            turn_id: self.turn_id.clone(),
            updated_at: self.updated_at,
            explanation: self.explanation.clone(),
            steps: self.steps.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub updated_at: i64,
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageView {
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// One logical activity within a run. Identity is the item id; statuses move
/// along pending → inProgress → {completed, failed, declined}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub step_id: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_end: Option<i64>,
    /// Kind-specific static attributes (command, cwd, changes, tool, query…).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Kind-specific terminal attributes (output, exit code, tool result…).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Accumulated delta text; append-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalView>,
    /// Ordered ids of the raw events that contributed to this step.
    pub raw_event_ids: Vec<String>,
}

impl StepView {
    pub fn new(step_id: String, kind: StepKind, thread_id: String, turn_id: Option<String>) -> Self {
        Self {
            step_id,
            kind,
            status: StepStatus::Pending,
            thread_id,
            turn_id,
            ts_start: None,
            ts_end: None,
            meta: None,
            result: None,
            stream: None,
            approval: None,
            raw_event_ids: Vec::new(),
        }
    }
}

/// Per-thread normalized projection of the agent event stream. `run_id` is
/// the thread id. Serialization is deterministic: steps are an ordered
/// vector and `meta` is a sorted map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    pub status: RunStatus,
    pub steps: Vec<StepView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsageView>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl RunView {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            created_at: None,
            status: RunStatus::Pending,
            steps: Vec::new(),
            plan: None,
            diff: None,
            token_usage: None,
            meta: serde_json::Map::new(),
        }
    }
}
