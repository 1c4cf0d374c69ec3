use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use sable_core::events::EngineEvent;
use sable_core::ids::SessionId;
use sable_core::provider::{CallOptions, ModelClient};
use sable_core::store::ConversationStore;
use sable_core::stream::StreamEvent;
use sable_core::turns::{Part, Role, ToolCallPart, ToolOutputPart, Turn};
use sable_core::usage::UsageInfo;

use sable_llm::adapter::{AdapterStream, StreamAdapter};

use crate::compaction::CompactionEngine;
use crate::coordinator::ToolCoordinator;
use crate::error::EngineError;
use crate::registry::ToolRegistry;

const DEFAULT_MAX_TURNS: u32 = 50;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RUN_DURATION: Duration = Duration::from_secs(3600);

pub struct SessionConfig {
    pub max_turns: u32,
    /// Caller-side deadline per tool call; the coordinator itself imposes
    /// none. `None` waits indefinitely.
    pub tool_timeout: Option<Duration>,
    pub max_run_duration: Duration,
    pub options: CallOptions,
    /// Check the token budget before each model call and compact as needed.
    pub auto_compact: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            max_run_duration: DEFAULT_MAX_RUN_DURATION,
            options: CallOptions::default(),
            auto_compact: true,
        }
    }
}

/// Drives the agent loop for one prompt: stream a model turn, forward
/// deltas, run the tool calls it requested, feed results back, repeat until
/// the model stops asking for tools.
pub struct SessionRunner {
    session_id: SessionId,
    client: Arc<dyn ModelClient>,
    store: Arc<dyn ConversationStore>,
    registry: Arc<ToolRegistry>,
    coordinator: Arc<ToolCoordinator>,
    compaction: CompactionEngine,
    events: broadcast::Sender<EngineEvent>,
    config: SessionConfig,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        client: Arc<dyn ModelClient>,
        store: Arc<dyn ConversationStore>,
        registry: Arc<ToolRegistry>,
        coordinator: Arc<ToolCoordinator>,
        compaction: CompactionEngine,
        events: broadcast::Sender<EngineEvent>,
        config: SessionConfig,
    ) -> Self {
        Self {
            session_id,
            client,
            store,
            registry,
            coordinator,
            compaction,
            events,
            config,
        }
    }

    fn send_event(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            warn!("no event receivers — event dropped");
        }
    }

    #[instrument(skip(self, prompt, cancel), fields(session_id = %self.session_id))]
    pub async fn run(&self, prompt: &str, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.store
            .append_turn(&self.session_id, Turn::user_text(prompt))?;

        let run_start = Instant::now();
        let mut turn_no = 1u32;
        let mut last_usage: Option<UsageInfo> = None;

        loop {
            if cancel.is_cancelled() {
                self.coordinator.cleanup();
                return Err(EngineError::Aborted);
            }
            if turn_no > self.config.max_turns {
                return Err(EngineError::MaxTurnsExceeded(self.config.max_turns));
            }
            if run_start.elapsed() >= self.config.max_run_duration {
                warn!(
                    elapsed_secs = run_start.elapsed().as_secs(),
                    "session exceeded max run duration"
                );
                return Err(EngineError::RunTimeout(self.config.max_run_duration));
            }

            if self.config.auto_compact {
                if let Some(usage) = &last_usage {
                    self.compaction
                        .ensure_within_budget(&self.session_id, usage, true)
                        .await?;
                }
            }

            let (ran_tools, usage) = self.execute_model_turn(turn_no, cancel).await?;
            last_usage = Some(usage);

            if !ran_tools {
                break;
            }
            turn_no += 1;
        }

        self.send_event(EngineEvent::SessionComplete {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }

    /// One model turn. Returns whether tool calls were executed (and the
    /// loop should continue) plus the turn's usage snapshot.
    async fn execute_model_turn(
        &self,
        turn_no: u32,
        cancel: &CancellationToken,
    ) -> Result<(bool, UsageInfo), EngineError> {
        self.send_event(EngineEvent::TurnStarted {
            session_id: self.session_id.clone(),
            turn: turn_no,
        });

        let turns = self.store.turns(&self.session_id)?;
        let mut options = self.config.options.clone();
        options.tools = self.registry.definitions();

        let bytes = self.client.stream(&turns, &options).await?;
        let adapter = StreamAdapter::new(self.client.chunk_parser());
        let mut stream = AdapterStream::new(bytes, adapter);

        let mut finished: Option<Turn> = None;
        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                self.coordinator.cleanup();
                return Err(EngineError::Aborted);
            }
            match event {
                StreamEvent::TextDelta { delta, .. } => {
                    self.send_event(EngineEvent::TextDelta {
                        session_id: self.session_id.clone(),
                        delta,
                    });
                }
                StreamEvent::ReasoningDelta { delta, .. } => {
                    self.send_event(EngineEvent::ReasoningDelta {
                        session_id: self.session_id.clone(),
                        delta,
                    });
                }
                StreamEvent::Finish { turn, .. } => finished = Some(turn),
                StreamEvent::Error { error } => return Err(error.into()),
                // Tool-call intents are read off the finished turn; provider
                // side tool results have no engine-side handling here.
                StreamEvent::ToolCall { .. } | StreamEvent::ToolResult { .. } => {}
            }
        }

        let usage = stream.usage().cloned().unwrap_or_default();
        let assistant_turn = finished.ok_or_else(|| {
            EngineError::Internal("stream ended without a finish event".into())
        })?;
        let assistant_turn_id = assistant_turn.id.clone();
        let tool_calls: Vec<ToolCallPart> =
            assistant_turn.tool_calls().into_iter().cloned().collect();

        self.store.append_turn(&self.session_id, assistant_turn)?;
        self.send_event(EngineEvent::TurnComplete {
            session_id: self.session_id.clone(),
            turn: turn_no,
            usage: usage.clone(),
        });

        if tool_calls.is_empty() {
            return Ok((false, usage));
        }

        let mut parts = Vec::with_capacity(tool_calls.len());
        for call in tool_calls {
            let watchdog = self.config.tool_timeout.map(|timeout| {
                let coordinator = Arc::clone(&self.coordinator);
                let call_id = call.call_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    coordinator.cancel_call(&call_id);
                })
            });

            let report = self
                .coordinator
                .execute(
                    &call.name,
                    call.input.clone(),
                    call.call_id.clone(),
                    assistant_turn_id.clone(),
                )
                .await?;

            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }

            parts.push(Part::ToolOutput(ToolOutputPart {
                call_id: report.call_id.clone(),
                tool_name: report.tool_name.clone(),
                status: report.status,
                output: report.result_text(),
                compacted_at: None,
            }));
        }
        self.store
            .append_turn(&self.session_id, Turn::new(Role::Tool, parts))?;

        Ok((true, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sable_core::permissions::{AutoApprove, PermissionAction, PermissionRule, RuleSet};
    use sable_core::tools::{Tool, ToolContext, ToolError, ToolOutput, ToolStatus};
    use sable_llm::mock::{MockClient, MockResponse};
    use sable_store::MemoryStore;

    use crate::coordinator::CoordinatorConfig;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its message input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"message": {"type": "string"}}})
        }
        async fn execute(
            &self,
            input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            let message = input
                .get("message")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidInput("message required".into()))?;
            Ok(ToolOutput::text("echo", message))
        }
    }

    struct StallTool;

    #[async_trait]
    impl Tool for StallTool {
        fn name(&self) -> &str {
            "stall"
        }
        fn description(&self) -> &str {
            "waits for cancellation"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _input: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            ctx.abort.cancelled().await;
            Err(ToolError::Cancelled)
        }
    }

    struct Harness {
        runner: SessionRunner,
        store: Arc<MemoryStore>,
        session_id: SessionId,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn harness(responses: Vec<MockResponse>, config: SessionConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let session_id = store.create_session();
        let client: Arc<dyn ModelClient> = Arc::new(MockClient::new(responses));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(StallTool));
        let registry = Arc::new(registry);

        let rule_sets = Arc::new(vec![RuleSet::new(vec![PermissionRule::new(
            "*",
            "*",
            PermissionAction::Allow,
        )])]);

        let (tx, rx) = broadcast::channel(256);
        let coordinator = Arc::new(ToolCoordinator::new(
            session_id.clone(),
            Arc::clone(&registry),
            rule_sets,
            Arc::new(AutoApprove),
            tx.clone(),
            CoordinatorConfig::default(),
        ));
        let compaction = CompactionEngine::new(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::clone(&client),
            tx.clone(),
        );
        let runner = SessionRunner::new(
            session_id.clone(),
            client,
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            registry,
            coordinator,
            compaction,
            tx,
            config,
        );

        Harness { runner, store, session_id, events: rx }
    }

    fn event_types(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            types.push(evt.event_type().to_string());
        }
        types
    }

    #[tokio::test]
    async fn single_text_turn() {
        let mut h = harness(vec![MockResponse::text("Hello there")], SessionConfig::default());
        let cancel = CancellationToken::new();

        h.runner.run("Hi", &cancel).await.unwrap();

        let turns = h.store.turns(&h.session_id).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text_content(), "Hi");
        assert_eq!(turns[1].text_content(), "Hello there");

        let types = event_types(&mut h.events);
        assert!(types.contains(&"turn_started".to_string()));
        assert!(types.contains(&"text_delta".to_string()));
        assert!(types.contains(&"turn_complete".to_string()));
        assert_eq!(types.last().unwrap(), "session_complete");
    }

    #[tokio::test]
    async fn tool_turn_roundtrip() {
        let mut h = harness(
            vec![
                MockResponse::tool_call("call_t1", "echo", serde_json::json!({"message": "ping"})),
                MockResponse::text("The tool said ping"),
            ],
            SessionConfig::default(),
        );
        let cancel = CancellationToken::new();

        h.runner.run("run echo", &cancel).await.unwrap();

        let turns = h.store.turns(&h.session_id).unwrap();
        // user, assistant(tool call), tool output, assistant text
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].role, Role::Tool);
        match &turns[2].parts[0] {
            Part::ToolOutput(out) => {
                assert_eq!(out.status, ToolStatus::Completed);
                assert_eq!(out.output, "ping");
                assert_eq!(out.call_id.as_str(), "call_t1");
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(turns[3].text_content(), "The tool said ping");

        let types = event_types(&mut h.events);
        assert!(types.contains(&"tool_started".to_string()));
        assert!(types.contains(&"tool_completed".to_string()));
    }

    #[tokio::test]
    async fn unknown_tool_from_model_becomes_error_output() {
        let mut h = harness(
            vec![
                MockResponse::tool_call("call_u1", "no_such_tool", serde_json::json!({})),
                MockResponse::text("recovered"),
            ],
            SessionConfig::default(),
        );
        let cancel = CancellationToken::new();

        h.runner.run("try it", &cancel).await.unwrap();

        let turns = h.store.turns(&h.session_id).unwrap();
        match &turns[2].parts[0] {
            Part::ToolOutput(out) => {
                assert_eq!(out.status, ToolStatus::Error);
                assert!(out.output.contains("unknown tool: no_such_tool"));
            }
            other => panic!("unexpected part: {other:?}"),
        }
        let types = event_types(&mut h.events);
        assert!(!types.contains(&"tool_started".to_string()));
    }

    #[tokio::test]
    async fn cancel_before_run_aborts() {
        let h = harness(vec![MockResponse::text("never")], SessionConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.runner.run("Hi", &cancel).await;
        assert!(matches!(result, Err(EngineError::Aborted)));
    }

    #[tokio::test]
    async fn max_turns_enforced() {
        let responses: Vec<MockResponse> = (0..5)
            .map(|i| {
                MockResponse::tool_call(
                    &format!("call_m{i}"),
                    "echo",
                    serde_json::json!({"message": format!("loop {i}")}),
                )
            })
            .collect();
        let h = harness(
            responses,
            SessionConfig { max_turns: 3, ..Default::default() },
        );
        let cancel = CancellationToken::new();

        let result = h.runner.run("loop forever", &cancel).await;
        assert!(matches!(result, Err(EngineError::MaxTurnsExceeded(3))));
    }

    #[tokio::test]
    async fn tool_timeout_cancels_call_and_loop_continues() {
        let h = harness(
            vec![
                MockResponse::tool_call("call_s1", "stall", serde_json::json!({})),
                MockResponse::text("moved on"),
            ],
            SessionConfig {
                tool_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        h.runner.run("stall out", &cancel).await.unwrap();

        let turns = h.store.turns(&h.session_id).unwrap();
        match &turns[2].parts[0] {
            Part::ToolOutput(out) => {
                assert_eq!(out.status, ToolStatus::Error);
                assert!(out.output.contains("cancelled"));
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(turns[3].text_content(), "moved on");
    }

    #[tokio::test]
    async fn run_duration_timeout() {
        let responses: Vec<MockResponse> = (0..10)
            .map(|i| {
                MockResponse::delayed(
                    Duration::from_millis(30),
                    MockResponse::tool_call(
                        &format!("call_d{i}"),
                        "echo",
                        serde_json::json!({"message": format!("tick {i}")}),
                    ),
                )
            })
            .collect();
        let h = harness(
            responses,
            SessionConfig {
                max_run_duration: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let result = h.runner.run("keep going", &cancel).await;
        assert!(matches!(result, Err(EngineError::RunTimeout(_))), "got: {result:?}");
    }

    #[tokio::test]
    async fn usage_snapshot_reaches_turn_complete() {
        let mut h = harness(vec![MockResponse::text("ok")], SessionConfig::default());
        let cancel = CancellationToken::new();
        h.runner.run("Hi", &cancel).await.unwrap();

        let mut saw_usage = false;
        while let Ok(evt) = h.events.try_recv() {
            if let EngineEvent::TurnComplete { usage, .. } = evt {
                // Scripted SSE reports input 100 / output 50.
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.output_tokens, 50);
                saw_usage = true;
            }
        }
        assert!(saw_usage);
    }
}
