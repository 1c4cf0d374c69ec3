use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use sable_core::events::EngineEvent;
use sable_core::ids::{CallId, SessionId, TurnId};
use sable_core::permissions::{self, ApprovalGate, PermissionAction, RuleSet};
use sable_core::tools::{Tool, ToolContext, ToolOutput, ToolStatus};

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::truncate;

const DEFAULT_MAX_CONCURRENT: usize = 8;
const DEFAULT_DOOM_LOOP_WINDOW: usize = 3;
const PREVIEW_CHARS: usize = 200;

pub struct CoordinatorConfig {
    /// Ceiling on concurrently running tool executions.
    pub max_concurrent: usize,
    /// How many recent inputs the doom-loop heuristic compares against.
    pub doom_loop_window: usize,
    pub working_directory: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            doom_loop_window: DEFAULT_DOOM_LOOP_WINDOW,
            working_directory: PathBuf::from("."),
        }
    }
}

/// Final record of one tool call. Rejections (permission deny, doom loop,
/// unknown tool) land here as terminal errors that never entered `Running`.
#[derive(Clone, Debug)]
pub struct ToolReport {
    pub call_id: CallId,
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: Option<ToolOutput>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: String,
}

impl ToolReport {
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Output text fed back to the model.
    pub fn result_text(&self) -> String {
        match (&self.output, &self.error) {
            (Some(out), _) => out.output.clone(),
            (None, Some(err)) => format!("[error] {err}"),
            (None, None) => String::new(),
        }
    }
}

struct ActiveCall {
    cancel: CancellationToken,
    status: ToolStatus,
}

enum Outcome {
    Completed(ToolOutput),
    Failed(String),
    Cancelled,
}

/// Executes tool calls for one session: permission gate, state machine,
/// lifecycle events, cooperative cancellation. The active-call table is the
/// only shared mutable state; everything else is read-only after construction.
pub struct ToolCoordinator {
    session_id: SessionId,
    registry: Arc<ToolRegistry>,
    rule_sets: Arc<Vec<RuleSet>>,
    approvals: Arc<dyn ApprovalGate>,
    events: broadcast::Sender<EngineEvent>,
    active: DashMap<CallId, ActiveCall>,
    recent_inputs: Mutex<VecDeque<serde_json::Value>>,
    semaphore: Arc<Semaphore>,
    doom_loop_window: usize,
    working_directory: PathBuf,
}

impl ToolCoordinator {
    pub fn new(
        session_id: SessionId,
        registry: Arc<ToolRegistry>,
        rule_sets: Arc<Vec<RuleSet>>,
        approvals: Arc<dyn ApprovalGate>,
        events: broadcast::Sender<EngineEvent>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            session_id,
            registry,
            rule_sets,
            approvals,
            events,
            active: DashMap::new(),
            recent_inputs: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            doom_loop_window: config.doom_loop_window,
            working_directory: config.working_directory,
        }
    }

    fn send_event(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            warn!("no event receivers — event dropped");
        }
    }

    /// True iff `input` structurally equals one of the last N inputs in this
    /// session. Heuristic only: false positives are acceptable.
    pub fn check_doom_loop(&self, input: &serde_json::Value) -> bool {
        self.recent_inputs.lock().iter().any(|recent| recent == input)
    }

    fn remember_input(&self, input: serde_json::Value) {
        let mut recent = self.recent_inputs.lock();
        recent.push_back(input);
        while recent.len() > self.doom_loop_window {
            recent.pop_front();
        }
    }

    /// Observed status of a still-active call.
    pub fn status(&self, call_id: &CallId) -> Option<ToolStatus> {
        self.active.get(call_id).map(|entry| entry.status)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Execute one tool call through the full lifecycle.
    ///
    /// `Err` is reserved for contract violations (duplicate call id);
    /// every tool-level failure comes back as a terminal error report so one
    /// failing call never takes down its neighbours.
    #[instrument(skip(self, input), fields(session_id = %self.session_id, tool = tool_name, call_id = %call_id))]
    pub async fn execute(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        call_id: CallId,
        turn_id: TurnId,
    ) -> Result<ToolReport, EngineError> {
        let cancel = CancellationToken::new();

        // Pending is recorded before any side effect. A call id that is
        // still active must not run twice.
        match self.active.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::DuplicateCall(call_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ActiveCall { cancel: cancel.clone(), status: ToolStatus::Pending });
            }
        }

        let report = self
            .run_call(tool_name, input, &call_id, &turn_id, cancel)
            .await;

        // Terminal transition releases the call's slot and token.
        self.active.remove(&call_id);
        Ok(report)
    }

    async fn run_call(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        call_id: &CallId,
        turn_id: &TurnId,
        cancel: CancellationToken,
    ) -> ToolReport {
        let tool = match self.registry.get(tool_name) {
            Some(tool) => tool,
            None => {
                warn!(tool = tool_name, "unknown tool requested");
                return self.rejected(call_id, turn_id, tool_name, format!("unknown tool: {tool_name}"));
            }
        };

        let looping = self.check_doom_loop(&input);
        self.remember_input(input.clone());
        if looping {
            self.send_event(EngineEvent::DoomLoop {
                session_id: self.session_id.clone(),
                tool_name: tool_name.to_string(),
            });
            if let Err(reason) = self.gate("doom_loop", tool_name).await {
                return self.rejected(call_id, turn_id, tool_name, reason);
            }
        }

        let pattern = tool.permission_pattern(&input);
        if let Err(reason) = self.gate(tool.permission(), &pattern).await {
            return self.rejected(call_id, turn_id, tool_name, reason);
        }

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    return self.rejected(call_id, turn_id, tool_name, format!("scheduler closed: {e}"));
                }
            },
            _ = cancel.cancelled() => {
                return self.rejected(call_id, turn_id, tool_name, "cancelled".to_string());
            }
        };

        // Permission passed and a slot is free: the call is now running.
        if let Some(mut entry) = self.active.get_mut(call_id) {
            entry.status = ToolStatus::Running;
        }
        let started_at = chrono::Utc::now().to_rfc3339();
        self.send_event(EngineEvent::ToolStarted {
            session_id: self.session_id.clone(),
            call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
        });

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            call_id: call_id.clone(),
            working_directory: self.working_directory.clone(),
            abort: cancel.clone(),
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = std::panic::AssertUnwindSafe(tool.execute(input, &ctx)).catch_unwind() => {
                match result {
                    Ok(Ok(output)) => Outcome::Completed(output),
                    Ok(Err(tool_err)) => Outcome::Failed(tool_err.to_string()),
                    Err(_) => {
                        warn!(tool = tool_name, "tool panicked during execution");
                        Outcome::Failed("internal error: tool crashed".to_string())
                    }
                }
            }
        };
        drop(permit);
        let duration_ms = start.elapsed().as_millis() as u64;
        let ended_at = chrono::Utc::now().to_rfc3339();

        match outcome {
            Outcome::Completed(mut output) => {
                let max = truncate::max_output_for_tool(tool_name);
                output.output = truncate::truncate_output(&output.output, max);
                self.send_event(EngineEvent::ToolCompleted {
                    session_id: self.session_id.clone(),
                    call_id: call_id.clone(),
                    tool_name: tool_name.to_string(),
                    output_preview: output.output.chars().take(PREVIEW_CHARS).collect(),
                    duration_ms,
                });
                ToolReport {
                    call_id: call_id.clone(),
                    session_id: self.session_id.clone(),
                    turn_id: turn_id.clone(),
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Completed,
                    output: Some(output),
                    error: None,
                    started_at: Some(started_at),
                    ended_at,
                }
            }
            Outcome::Failed(reason) => {
                self.send_event(EngineEvent::ToolError {
                    session_id: self.session_id.clone(),
                    call_id: call_id.clone(),
                    tool_name: tool_name.to_string(),
                    reason: reason.clone(),
                });
                ToolReport {
                    call_id: call_id.clone(),
                    session_id: self.session_id.clone(),
                    turn_id: turn_id.clone(),
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Error,
                    output: None,
                    error: Some(reason),
                    started_at: Some(started_at),
                    ended_at,
                }
            }
            Outcome::Cancelled => {
                self.send_event(EngineEvent::ToolError {
                    session_id: self.session_id.clone(),
                    call_id: call_id.clone(),
                    tool_name: tool_name.to_string(),
                    reason: "cancelled".to_string(),
                });
                ToolReport {
                    call_id: call_id.clone(),
                    session_id: self.session_id.clone(),
                    turn_id: turn_id.clone(),
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Error,
                    output: None,
                    error: Some("cancelled".to_string()),
                    started_at: Some(started_at),
                    ended_at,
                }
            }
        }
    }

    /// Terminal error for a call that never entered `Running`. No lifecycle
    /// events: the started → terminal contract covers executed calls only.
    fn rejected(
        &self,
        call_id: &CallId,
        turn_id: &TurnId,
        tool_name: &str,
        reason: String,
    ) -> ToolReport {
        ToolReport {
            call_id: call_id.clone(),
            session_id: self.session_id.clone(),
            turn_id: turn_id.clone(),
            tool_name: tool_name.to_string(),
            status: ToolStatus::Error,
            output: None,
            error: Some(reason),
            started_at: None,
            ended_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    async fn gate(&self, permission: &str, pattern: &str) -> Result<(), String> {
        let rule = permissions::evaluate(&self.rule_sets, permission, pattern);
        match rule.action {
            PermissionAction::Allow => Ok(()),
            PermissionAction::Deny => {
                Err(format!("permission denied: {permission} ({pattern})"))
            }
            PermissionAction::Ask => {
                if self
                    .approvals
                    .request(&self.session_id, permission, pattern)
                    .await
                {
                    Ok(())
                } else {
                    Err(format!("permission request rejected: {permission} ({pattern})"))
                }
            }
        }
    }

    /// Cooperatively cancel one active call. No-op for unknown or already
    /// terminal ids.
    pub fn cancel_call(&self, call_id: &CallId) {
        if let Some(entry) = self.active.get(call_id) {
            entry.cancel.cancel();
        }
    }

    /// Session teardown: cooperatively cancel every active call and clear
    /// the table. In-flight executions observe their token and report
    /// `cancelled`.
    pub fn cleanup(&self) {
        for entry in self.active.iter() {
            entry.value().cancel.cancel();
        }
        self.active.clear();
    }
}
