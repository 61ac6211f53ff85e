//! Folds the supervisor's raw event stream into per-thread [`RunView`]s.
//!
//! The mapper performs no I/O and observes events in arrival order; feeding
//! the same sequence to a fresh mapper is deterministic. Steps are never
//! removed, statuses never leave a terminal state, and `stream` only grows.

use std::collections::HashMap;

use serde_json::Value;

use cloud_codex_protocol::ir::ApprovalStatus;
use cloud_codex_protocol::ir::ApprovalView;
use cloud_codex_protocol::ir::COMMAND_APPROVAL_METHOD;
use cloud_codex_protocol::ir::DiffView;
use cloud_codex_protocol::ir::FILE_CHANGE_APPROVAL_METHOD;
use cloud_codex_protocol::ir::PlanStepView;
use cloud_codex_protocol::ir::PlanVersion;
use cloud_codex_protocol::ir::PlanView;
use cloud_codex_protocol::ir::RawEvent;
use cloud_codex_protocol::ir::RunStatus;
use cloud_codex_protocol::ir::RunView;
use cloud_codex_protocol::ir::StepKind;
use cloud_codex_protocol::ir::StepStatus;
use cloud_codex_protocol::ir::StepView;
use cloud_codex_protocol::ir::TokenUsageView;
use cloud_codex_protocol::ir::thread_id_from_params;
use cloud_codex_protocol::ir::turn_id_from_params;

pub struct RunViewMapper {
    raw_log: Vec<RawEvent>,
    runs: HashMap<String, RunState>,
}

struct RunState {
    view: RunView,
    step_index: HashMap<String, usize>,
}

impl RunState {
    fn new(thread_id: &str) -> Self {
        Self {
            view: RunView::new(thread_id.to_string()),
            step_index: HashMap::new(),
        }
    }

    /// Look up a step by item id, creating it when absent. `kind` is only
    /// authoritative for a fresh step; an existing step keeps its kind unless
    /// the caller overwrites it explicitly.
    fn resolve_step(&mut self, item_id: &str, kind: StepKind, turn_id: Option<&str>) -> usize {
        if let Some(idx) = self.step_index.get(item_id) {
            return *idx;
        }
        let step = StepView::new(
            item_id.to_string(),
            kind,
            self.view.run_id.clone(),
            turn_id.map(str::to_owned),
        );
        self.view.steps.push(step);
        let idx = self.view.steps.len() - 1;
        self.step_index.insert(item_id.to_string(), idx);
        idx
    }

    /// Force-complete reasoning steps still in progress within `turn_id`.
    fn close_reasoning_in_turn(&mut self, turn_id: Option<&str>, ts: i64, raw_id: &str) {
        for step in &mut self.view.steps {
            if step.kind == StepKind::Reasoning
                && step.status == StepStatus::InProgress
                && step.turn_id.as_deref() == turn_id
            {
                step.status = StepStatus::Completed;
                step.ts_end = Some(ts);
                record_raw_id(step, raw_id);
            }
        }
    }
}

fn record_raw_id(step: &mut StepView, raw_id: &str) {
    if step.raw_event_ids.iter().all(|id| id != raw_id) {
        step.raw_event_ids.push(raw_id.to_string());
    }
}

impl Default for RunViewMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl RunViewMapper {
    pub fn new() -> Self {
        Self {
            raw_log: Vec::new(),
            runs: HashMap::new(),
        }
    }

    pub fn raw_log(&self) -> &[RawEvent] {
        &self.raw_log
    }

    pub fn run_view(&self, thread_id: &str) -> Option<&RunView> {
        self.runs.get(thread_id).map(|run| &run.view)
    }

    /// Apply one event. Returns a snapshot of the updated run view, or `None`
    /// when no run view was touched (no thread id, unknown event family).
    pub fn consume(&mut self, event: &RawEvent) -> Option<RunView> {
        self.raw_log.push(event.clone());

        let thread_id = event
            .thread_id
            .clone()
            .or_else(|| thread_id_from_params(&event.payload))?;
        let turn_id = event
            .turn_id
            .clone()
            .or_else(|| turn_id_from_params(&event.payload));

        let run = self
            .runs
            .entry(thread_id.clone())
            .or_insert_with(|| RunState::new(&thread_id));

        let touched = match event.ty.as_str() {
            "thread/started" => {
                run.view.created_at = Some(event.ts);
                true
            }
            "turn/started" => {
                run.view.status = RunStatus::InProgress;
                if let Some(turn) = &turn_id {
                    run.view
                        .meta
                        .insert("lastTurnId".to_string(), Value::String(turn.clone()));
                }
                true
            }
            "turn/completed" => {
                run.view.status = event
                    .payload
                    .get("status")
                    .and_then(|status| serde_json::from_value(status.clone()).ok())
                    .unwrap_or(RunStatus::Completed);
                run.close_reasoning_in_turn(turn_id.as_deref(), event.ts, &event.id);
                true
            }
            "turn/plan/updated" => {
                let mut history: Vec<PlanVersion> = Vec::new();
                if let Some(prior) = run.view.plan.take() {
                    history = prior.history.clone();
                    history.push(prior.as_version());
                }
                run.view.plan = Some(PlanView {
                    turn_id: turn_id.clone(),
                    updated_at: event.ts,
                    explanation: event
                        .payload
                        .get("explanation")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    steps: plan_steps(&event.payload),
                    history,
                });
                true
            }
            "turn/diff/updated" => {
                run.view.diff = Some(DiffView {
                    turn_id: turn_id.clone(),
                    updated_at: event.ts,
                    diff: event
                        .payload
                        .get("diff")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
                true
            }
            "thread/tokenUsage/updated" => {
                run.view.token_usage = Some(TokenUsageView {
                    updated_at: event.ts,
                    input_tokens: event.payload.get("inputTokens").and_then(Value::as_u64),
                    output_tokens: event.payload.get("outputTokens").and_then(Value::as_u64),
                    total_tokens: event.payload.get("totalTokens").and_then(Value::as_u64),
                });
                true
            }
            "item/started" => apply_item_started(run, event, turn_id.as_deref()),
            "item/completed" => apply_item_completed(run, event, turn_id.as_deref()),
            COMMAND_APPROVAL_METHOD => {
                apply_approval_request(run, event, turn_id.as_deref(), StepKind::CommandExecution)
            }
            FILE_CHANGE_APPROVAL_METHOD => {
                apply_approval_request(run, event, turn_id.as_deref(), StepKind::FileChange)
            }
            method => match delta_kind(method) {
                Some(kind) => apply_delta(run, event, turn_id.as_deref(), kind),
                None => false,
            },
        };

        touched.then(|| run.view.clone())
    }

    /// Synthesize a completed `systemNote` step, used to surface unsolicited
    /// process errors on the run they belong to.
    pub fn add_system_note(
        &mut self,
        thread_id: &str,
        note_id: &str,
        summary: &str,
        details: &str,
        ts: i64,
    ) -> Option<RunView> {
        let run = self.runs.get_mut(thread_id)?;
        let idx = run.resolve_step(note_id, StepKind::SystemNote, None);
        let step = &mut run.view.steps[idx];
        step.status = StepStatus::Completed;
        if step.ts_start.is_none() {
            step.ts_start = Some(ts);
        }
        step.ts_end = Some(ts);
        step.meta = Some(serde_json::json!({ "text": summary }));
        step.result = Some(serde_json::json!({ "details": details }));
        Some(run.view.clone())
    }

    /// Record that the broker opened (or auto-resolved) an approval on a step.
    pub fn attach_approval(
        &mut self,
        thread_id: &str,
        item_id: &str,
        approval: ApprovalView,
    ) -> Option<RunView> {
        let run = self.runs.get_mut(thread_id)?;
        let idx = *run.step_index.get(item_id)?;
        run.view.steps[idx].approval = Some(approval);
        Some(run.view.clone())
    }

    /// Transition an approval out of `pending` and map the step status:
    /// accepted resumes the step, declined/timeout terminate it as declined.
    pub fn resolve_approval(
        &mut self,
        thread_id: &str,
        approval_id: &str,
        status: ApprovalStatus,
        ts: i64,
    ) -> Option<RunView> {
        let run = self.runs.get_mut(thread_id)?;
        let step = run.view.steps.iter_mut().find(|step| {
            step.approval
                .as_ref()
                .is_some_and(|approval| approval.approval_id == approval_id)
        })?;
        if let Some(approval) = &mut step.approval {
            approval.status = status;
        }
        if !step.status.is_terminal() {
            match status {
                ApprovalStatus::Accepted => step.status = StepStatus::InProgress,
                ApprovalStatus::Declined | ApprovalStatus::Timeout => {
                    step.status = StepStatus::Declined;
                    step.ts_end = Some(ts);
                }
                ApprovalStatus::Pending => {}
            }
        }
        Some(run.view.clone())
    }
}

fn apply_item_started(run: &mut RunState, event: &RawEvent, turn_id: Option<&str>) -> bool {
    let item = event.payload.get("item").unwrap_or(&event.payload);
    let Some(item_id) = item_id_of(item, &event.payload) else {
        return false;
    };
    let kind = StepKind::from_item_type(item_type_of(item));

    if kind != StepKind::Reasoning {
        run.close_reasoning_in_turn(turn_id, event.ts, &event.id);
    }

    let idx = run.resolve_step(&item_id, kind, turn_id);
    let step = &mut run.view.steps[idx];
    if !step.status.is_terminal() {
        step.kind = kind;
        step.status = StepStatus::InProgress;
        if let Some(meta) = step_meta(kind, item) {
            step.meta = Some(meta);
        }
    }
    if step.ts_start.is_none() {
        step.ts_start = Some(event.ts);
    }
    record_raw_id(step, &event.id);
    true
}

fn apply_item_completed(run: &mut RunState, event: &RawEvent, turn_id: Option<&str>) -> bool {
    let item = event.payload.get("item").unwrap_or(&event.payload);
    let Some(item_id) = item_id_of(item, &event.payload) else {
        return false;
    };
    let kind = StepKind::from_item_type(item_type_of(item));

    let idx = run.resolve_step(&item_id, kind, turn_id);
    let step = &mut run.view.steps[idx];
    // A reasoning item always completes, whatever status it reports.
    step.status = if step.kind == StepKind::Reasoning || kind == StepKind::Reasoning {
        StepStatus::Completed
    } else {
        item_status_of(item)
    };
    step.ts_end = Some(event.ts);
    if step.ts_start.is_none() {
        step.ts_start = Some(event.ts);
    }
    if let Some(result) = step_result(step.kind, item) {
        step.result = Some(result);
    }
    record_raw_id(step, &event.id);
    true
}

fn apply_approval_request(
    run: &mut RunState,
    event: &RawEvent,
    turn_id: Option<&str>,
    kind: StepKind,
) -> bool {
    let Some(item_id) = event
        .payload
        .get("itemId")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return false;
    };
    let idx = run.resolve_step(&item_id, kind, turn_id);
    let step = &mut run.view.steps[idx];
    if !step.status.is_terminal() {
        // The step parks here until the approval resolves.
        step.status = StepStatus::Pending;
    }
    if step.meta.is_none() {
        step.meta = step_meta(kind, &event.payload);
    }
    record_raw_id(step, &event.id);
    true
}

fn apply_delta(run: &mut RunState, event: &RawEvent, turn_id: Option<&str>, kind: StepKind) -> bool {
    let Some(item_id) = event
        .payload
        .get("itemId")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return false;
    };
    let idx = run.resolve_step(&item_id, kind, turn_id);
    let step = &mut run.view.steps[idx];
    let delta = event
        .payload
        .get("delta")
        .or_else(|| event.payload.get("text"))
        .and_then(Value::as_str);
    if let Some(text) = delta {
        step.stream.get_or_insert_with(String::new).push_str(text);
    }
    record_raw_id(step, &event.id);
    true
}

fn delta_kind(method: &str) -> Option<StepKind> {
    match method {
        "item/agentMessage/delta" => Some(StepKind::AssistantMessage),
        "item/reasoning/summaryTextDelta"
        | "item/reasoning/summaryPartAdded"
        | "item/reasoning/textDelta" => Some(StepKind::Reasoning),
        "item/commandExecution/outputDelta" => Some(StepKind::CommandExecution),
        "item/fileChange/outputDelta" => Some(StepKind::FileChange),
        _ => None,
    }
}

fn item_id_of(item: &Value, payload: &Value) -> Option<String> {
    item.get("id")
        .and_then(Value::as_str)
        .or_else(|| payload.get("itemId").and_then(Value::as_str))
        .map(str::to_owned)
}

fn item_type_of(item: &Value) -> &str {
    item.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn item_status_of(item: &Value) -> StepStatus {
    match item.get("status").and_then(Value::as_str) {
        Some("failed") => StepStatus::Failed,
        Some("declined") => StepStatus::Declined,
        _ => StepStatus::Completed,
    }
}

fn plan_steps(payload: &Value) -> Vec<PlanStepView> {
    payload
        .get("steps")
        .cloned()
        .and_then(|steps| serde_json::from_value(steps).ok())
        .unwrap_or_default()
}

/// Kind-specific static attributes, pulled from the item (or the approval
/// request params, which carry the same keys inline).
fn step_meta(kind: StepKind, source: &Value) -> Option<Value> {
    let keys: &[&str] = match kind {
        StepKind::CommandExecution => &["command", "cwd"],
        StepKind::FileChange => &["changes", "cwd"],
        StepKind::McpToolCall | StepKind::CollabToolCall => &["server", "tool", "arguments"],
        StepKind::WebSearch => &["query"],
        StepKind::UserMessage | StepKind::AssistantMessage => &["text"],
        _ => &[],
    };
    collect_keys(source, keys)
}

/// Kind-specific terminal attributes.
fn step_result(kind: StepKind, item: &Value) -> Option<Value> {
    let mut out = serde_json::Map::new();
    match kind {
        StepKind::CommandExecution | StepKind::FileChange => {
            if let Some(output) = item.get("aggregatedOutput") {
                out.insert("output".to_string(), output.clone());
            }
            copy_key(item, &mut out, "exitCode");
            copy_key(item, &mut out, "durationMs");
        }
        StepKind::McpToolCall | StepKind::CollabToolCall => {
            copy_key(item, &mut out, "result");
            copy_key(item, &mut out, "error");
            copy_key(item, &mut out, "durationMs");
        }
        StepKind::UserMessage | StepKind::AssistantMessage | StepKind::Reasoning => {
            copy_key(item, &mut out, "text");
        }
        _ => {}
    }
    (!out.is_empty()).then(|| Value::Object(out))
}

fn collect_keys(source: &Value, keys: &[&str]) -> Option<Value> {
    let mut out = serde_json::Map::new();
    for key in keys {
        copy_key(source, &mut out, key);
    }
    (!out.is_empty()).then(|| Value::Object(out))
}

fn copy_key(source: &Value, out: &mut serde_json::Map<String, Value>, key: &str) {
    if let Some(value) = source.get(key) {
        if !value.is_null() {
            out.insert(key.to_string(), value.clone());
        }
    }
}
