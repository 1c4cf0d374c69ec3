use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use sable_core::events::EngineEvent;
use sable_core::ids::{SessionId, TurnId};
use sable_core::provider::{CallOptions, ModelClient, ModelLimits};
use sable_core::store::ConversationStore;
use sable_core::tools::ToolStatus;
use sable_core::turns::{estimate_text_tokens, Part, Role, Turn};
use sable_core::usage::UsageInfo;

use crate::error::EngineError;

/// Hard ceiling on reserved output, independent of what the model reports.
pub const OUTPUT_TOKEN_MAX: u64 = 32_000;
/// Newest eligible tool output worth this many tokens survives pruning.
pub const PRUNE_PROTECT: u64 = 40_000;
/// Prunes smaller than this are not worth the mutation; they are discarded.
pub const PRUNE_MINIMUM: u64 = 20_000;
/// Tool categories whose output is never pruned, regardless of age.
pub const PROTECTED_TOOLS: &[&str] = &["skill"];

const PROTECTED_USER_TURNS: usize = 2;

const SUMMARY_INSTRUCTION: &str = "Summarize this conversation so it can continue in a new session. \
The new session will have no access to the turns above, so capture the task, key decisions, \
important file paths and code state, and any unfinished work in enough detail to pick up where \
this left off. Respond with the summary only.";

/// Input budget available before overflow. Zero when the model declares no
/// context limit — never guess a budget.
pub fn usable_budget(limits: &ModelLimits) -> u64 {
    if limits.context_limit == 0 {
        return 0;
    }
    match limits.input_limit {
        Some(input_limit) => input_limit,
        None => limits
            .context_limit
            .saturating_sub(limits.output_limit.min(OUTPUT_TOKEN_MAX)),
    }
}

pub fn is_overflow(usage: &UsageInfo, limits: &ModelLimits) -> bool {
    if limits.context_limit == 0 {
        return false;
    }
    usage.context_total() > usable_budget(limits)
}

#[derive(Clone, Debug)]
pub struct SummarizeOutcome {
    pub summary_turn_id: TurnId,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

#[derive(Clone, Debug)]
pub enum CompactionOutcome {
    /// Under budget, nothing done.
    Untouched,
    Pruned { tokens_pruned: u64 },
    Summarized(SummarizeOutcome),
}

/// Keeps a session under its model's usable context: local pruning first,
/// model-driven summarization when pruning is not enough.
pub struct CompactionEngine {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn ModelClient>,
    events: broadcast::Sender<EngineEvent>,
}

impl CompactionEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn ModelClient>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self { store, client, events }
    }

    fn send_event(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            warn!("no event receivers — event dropped");
        }
    }

    /// Tombstone stale tool output. Returns the estimated tokens pruned, or
    /// 0 when nothing qualified or the prune was below [`PRUNE_MINIMUM`].
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn prune(&self, session_id: &SessionId) -> Result<u64, EngineError> {
        let turns = self.store.turns(session_id)?;

        // The two most recent user turns, and everything after them, are off
        // limits. `cutoff` is the index of the second-most-recent user turn.
        let mut users_seen = 0;
        let mut cutoff = None;
        for (i, turn) in turns.iter().enumerate().rev() {
            if turn.is_user() {
                users_seen += 1;
                if users_seen == PROTECTED_USER_TURNS {
                    cutoff = Some(i);
                    break;
                }
            }
        }
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let mut kept = 0u64;
        let mut marked: Vec<(TurnId, usize, u64)> = Vec::new();

        'scan: for turn in turns[..cutoff].iter().rev() {
            if turn.has_summary() {
                // Everything before a prior compaction point is already
                // covered by its summary.
                break 'scan;
            }
            for (index, part) in turn.parts.iter().enumerate().rev() {
                let Part::ToolOutput(out) = part else { continue };
                if out.status != ToolStatus::Completed
                    || out.compacted_at.is_some()
                    || PROTECTED_TOOLS.contains(&out.tool_name.as_str())
                {
                    continue;
                }
                let estimate = estimate_text_tokens(&out.output);
                if kept > PRUNE_PROTECT {
                    marked.push((turn.id.clone(), index, estimate));
                } else {
                    kept += estimate;
                }
            }
        }

        let total: u64 = marked.iter().map(|(_, _, est)| est).sum();
        if total <= PRUNE_MINIMUM {
            return Ok(0);
        }

        let tokens_before: u64 = turns.iter().map(Turn::estimated_tokens).sum();
        self.send_event(EngineEvent::CompactionStarted { session_id: session_id.clone() });

        let timestamp = chrono::Utc::now().to_rfc3339();
        for (turn_id, index, _) in &marked {
            self.store
                .mark_compacted(session_id, turn_id, *index, &timestamp)?;
        }

        info!(parts = marked.len(), tokens = total, "pruned stale tool output");
        self.send_event(EngineEvent::CompactionComplete {
            session_id: session_id.clone(),
            tokens_before,
            tokens_after: tokens_before.saturating_sub(total),
        });
        Ok(total)
    }

    /// Summarization fallback: condense everything up to and including
    /// `parent_turn_id` into a summary-marked assistant turn that future
    /// pruning scans stop at. In automatic mode a synthetic `continue` user
    /// turn is appended so the agent loop proceeds unattended.
    #[instrument(skip(self), fields(session_id = %session_id, parent = %parent_turn_id))]
    pub async fn summarize(
        &self,
        parent_turn_id: &TurnId,
        session_id: &SessionId,
        auto: bool,
    ) -> Result<SummarizeOutcome, EngineError> {
        let turns = self.store.turns(session_id)?;
        let parent_index = turns
            .iter()
            .position(|t| &t.id == parent_turn_id)
            .ok_or_else(|| EngineError::MissingParent(parent_turn_id.clone()))?;

        let tokens_before: u64 = turns.iter().map(Turn::estimated_tokens).sum();
        self.send_event(EngineEvent::CompactionStarted { session_id: session_id.clone() });

        let transcript = build_transcript(&turns[..=parent_index]);
        let request = vec![Turn::user_text(format!("{transcript}\n\n{SUMMARY_INSTRUCTION}"))];
        let response = self.client.complete(&request, &CallOptions::default()).await?;

        let summary_turn = Turn::new(
            Role::Assistant,
            vec![Part::Summary { text: response.text_content() }],
        );
        let summary_turn_id = summary_turn.id.clone();
        let tokens_after = summary_turn.estimated_tokens();
        self.store.append_turn(session_id, summary_turn)?;

        if auto {
            self.store.append_turn(session_id, Turn::user_text("continue"))?;
        }

        info!(tokens_before, tokens_after, "conversation summarized");
        self.send_event(EngineEvent::CompactionComplete {
            session_id: session_id.clone(),
            tokens_before,
            tokens_after,
        });

        Ok(SummarizeOutcome { summary_turn_id, tokens_before, tokens_after })
    }

    /// Two-phase compaction driven by the latest usage snapshot: no-op under
    /// budget, prune first, summarize only when pruning cannot close the gap.
    pub async fn ensure_within_budget(
        &self,
        session_id: &SessionId,
        usage: &UsageInfo,
        auto: bool,
    ) -> Result<CompactionOutcome, EngineError> {
        let limits = self.client.limits();
        if !is_overflow(usage, &limits) {
            return Ok(CompactionOutcome::Untouched);
        }

        let tokens_pruned = self.prune(session_id)?;
        let remaining = usage.context_total().saturating_sub(tokens_pruned);
        if tokens_pruned > 0 && remaining <= usable_budget(&limits) {
            return Ok(CompactionOutcome::Pruned { tokens_pruned });
        }

        let turns = self.store.turns(session_id)?;
        let parent = turns
            .last()
            .map(|t| t.id.clone())
            .ok_or_else(|| EngineError::Internal("cannot summarize an empty session".into()))?;
        let outcome = self.summarize(&parent, session_id, auto).await?;
        Ok(CompactionOutcome::Summarized(outcome))
    }
}

/// Flatten turns into a plain transcript for the summarization request.
/// Pruned tool output is represented by a placeholder.
fn build_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        match turn.role {
            Role::User => {
                out.push_str("User: ");
                out.push_str(&turn.text_content());
                out.push('\n');
            }
            Role::Assistant => {
                let text = turn.text_content();
                if !text.is_empty() {
                    out.push_str("Assistant: ");
                    out.push_str(&text);
                    out.push('\n');
                }
                for call in turn.tool_calls() {
                    out.push_str(&format!("Assistant called tool {}\n", call.name));
                }
            }
            Role::Tool => {
                for part in &turn.parts {
                    if let Part::ToolOutput(tool_out) = part {
                        if tool_out.compacted_at.is_some() {
                            out.push_str(&format!("Tool {}: [output pruned]\n", tool_out.tool_name));
                        } else {
                            out.push_str(&format!(
                                "Tool {}: {}\n",
                                tool_out.tool_name, tool_out.output
                            ));
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_core::ids::CallId;
    use sable_core::turns::ToolOutputPart;
    use sable_llm::mock::{MockClient, MockResponse};
    use sable_store::MemoryStore;

    fn limits(context: u64, output: u64, input: Option<u64>) -> ModelLimits {
        ModelLimits { context_limit: context, output_limit: output, input_limit: input }
    }

    fn usage(input: u64, cache_read: u64, output: u64) -> UsageInfo {
        UsageInfo {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: Some(cache_read),
            ..Default::default()
        }
    }

    #[test]
    fn overflow_reserves_capped_output() {
        // usable = 100000 - min(40000, 32000) = 68000; total = 75000.
        assert!(is_overflow(&usage(70_000, 0, 5_000), &limits(100_000, 40_000, None)));
        // total = 68000 is not overflow (strictly greater required).
        assert!(!is_overflow(&usage(63_000, 0, 5_000), &limits(100_000, 40_000, None)));
    }

    #[test]
    fn overflow_prefers_declared_input_limit() {
        assert!(!is_overflow(&usage(70_000, 0, 5_000), &limits(100_000, 40_000, Some(80_000))));
        assert!(is_overflow(&usage(79_000, 0, 2_000), &limits(100_000, 40_000, Some(80_000))));
    }

    #[test]
    fn unknown_context_limit_never_overflows() {
        assert!(!is_overflow(&usage(1_000_000, 0, 1_000_000), &limits(0, 32_000, None)));
    }

    #[test]
    fn small_output_reserve_used_when_below_cap() {
        // usable = 100000 - min(8000, 32000) = 92000
        assert!(!is_overflow(&usage(90_000, 0, 1_000), &limits(100_000, 8_000, None)));
        assert!(is_overflow(&usage(90_000, 2_500, 1_000), &limits(100_000, 8_000, None)));
    }

    // --- prune ---

    fn tool_turn(tokens: u64, tool_name: &str, status: ToolStatus) -> Turn {
        Turn::tool_output(ToolOutputPart {
            call_id: CallId::new(),
            tool_name: tool_name.into(),
            status,
            output: "x".repeat((tokens * 4) as usize),
            compacted_at: None,
        })
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: CompactionEngine,
        session: SessionId,
    }

    fn fixture(responses: Vec<MockResponse>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let session = store.create_session();
        let (tx, _rx) = broadcast::channel(64);
        let engine = CompactionEngine::new(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::new(MockClient::new(responses)),
            tx,
        );
        Fixture { store, engine, session }
    }

    /// Oldest-first layout: prunable turns, a window filler, then the two
    /// protected user turns. `prunable_tokens` end up past PRUNE_PROTECT.
    fn seed_prunable(f: &Fixture, prunable_tokens: &[u64]) {
        let store = &f.store;
        store.append_turn(&f.session, Turn::user_text("start")).unwrap();
        for tokens in prunable_tokens {
            store
                .append_turn(&f.session, tool_turn(*tokens, "bash", ToolStatus::Completed))
                .unwrap();
        }
        // Newest eligible output: fills the protect window on its own.
        store
            .append_turn(&f.session, tool_turn(PRUNE_PROTECT + 1, "bash", ToolStatus::Completed))
            .unwrap();
        store.append_turn(&f.session, Turn::user_text("next question")).unwrap();
        store.append_turn(&f.session, Turn::user_text("latest question")).unwrap();
    }

    fn compacted_part_count(f: &Fixture) -> usize {
        f.store
            .turns(&f.session)
            .unwrap()
            .iter()
            .flat_map(|t| t.parts.iter())
            .filter(|p| matches!(p, Part::ToolOutput(out) if out.compacted_at.is_some()))
            .count()
    }

    #[test]
    fn prune_below_minimum_mutates_nothing() {
        let f = fixture(vec![]);
        seed_prunable(&f, &[PRUNE_MINIMUM - 1]);
        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
        assert_eq!(compacted_part_count(&f), 0);
    }

    #[test]
    fn prune_above_minimum_commits() {
        let f = fixture(vec![]);
        seed_prunable(&f, &[PRUNE_MINIMUM + 1]);
        let pruned = f.engine.prune(&f.session).unwrap();
        assert!(pruned >= PRUNE_MINIMUM);
        assert_eq!(pruned, PRUNE_MINIMUM + 1);
        assert_eq!(compacted_part_count(&f), 1);

        // Content survives the tombstone.
        let turns = f.store.turns(&f.session).unwrap();
        let pruned_part = turns
            .iter()
            .flat_map(|t| t.parts.iter())
            .find_map(|p| match p {
                Part::ToolOutput(out) if out.compacted_at.is_some() => Some(out),
                _ => None,
            })
            .unwrap();
        assert!(!pruned_part.output.is_empty());
    }

    #[test]
    fn two_user_turns_are_never_pruned() {
        let f = fixture(vec![]);
        f.store.append_turn(&f.session, Turn::user_text("first")).unwrap();
        f.store
            .append_turn(&f.session, tool_turn(200_000, "bash", ToolStatus::Completed))
            .unwrap();
        f.store.append_turn(&f.session, Turn::user_text("second")).unwrap();

        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
        assert_eq!(compacted_part_count(&f), 0);
    }

    #[test]
    fn protected_tool_category_survives() {
        let f = fixture(vec![]);
        f.store.append_turn(&f.session, Turn::user_text("start")).unwrap();
        f.store
            .append_turn(&f.session, tool_turn(100_000, "skill", ToolStatus::Completed))
            .unwrap();
        f.store
            .append_turn(&f.session, tool_turn(PRUNE_PROTECT + 1, "bash", ToolStatus::Completed))
            .unwrap();
        f.store.append_turn(&f.session, Turn::user_text("next")).unwrap();
        f.store.append_turn(&f.session, Turn::user_text("latest")).unwrap();

        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
        assert_eq!(compacted_part_count(&f), 0);
    }

    #[test]
    fn incomplete_tool_output_is_not_prunable() {
        let f = fixture(vec![]);
        f.store.append_turn(&f.session, Turn::user_text("start")).unwrap();
        f.store
            .append_turn(&f.session, tool_turn(100_000, "bash", ToolStatus::Error))
            .unwrap();
        f.store
            .append_turn(&f.session, tool_turn(PRUNE_PROTECT + 1, "bash", ToolStatus::Completed))
            .unwrap();
        f.store.append_turn(&f.session, Turn::user_text("next")).unwrap();
        f.store.append_turn(&f.session, Turn::user_text("latest")).unwrap();

        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
    }

    #[test]
    fn scan_stops_at_prior_summary() {
        let f = fixture(vec![]);
        // Old output that would otherwise be pruned sits behind a summary.
        f.store
            .append_turn(&f.session, tool_turn(200_000, "bash", ToolStatus::Completed))
            .unwrap();
        f.store
            .append_turn(
                &f.session,
                Turn::new(Role::Assistant, vec![Part::Summary { text: "earlier work".into() }]),
            )
            .unwrap();
        f.store.append_turn(&f.session, Turn::user_text("start")).unwrap();
        f.store
            .append_turn(&f.session, tool_turn(PRUNE_PROTECT + 1, "bash", ToolStatus::Completed))
            .unwrap();
        f.store.append_turn(&f.session, Turn::user_text("next")).unwrap();
        f.store.append_turn(&f.session, Turn::user_text("latest")).unwrap();

        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
        assert_eq!(compacted_part_count(&f), 0);
    }

    #[test]
    fn already_compacted_parts_are_skipped() {
        let f = fixture(vec![]);
        seed_prunable(&f, &[PRUNE_MINIMUM + 1]);
        let first = f.engine.prune(&f.session).unwrap();
        assert!(first > 0);
        // Second pass finds nothing new.
        assert_eq!(f.engine.prune(&f.session).unwrap(), 0);
    }

    // --- summarize ---

    #[tokio::test]
    async fn summarize_appends_anchor_turn() {
        let f = fixture(vec![MockResponse::text("we built the parser")]);
        f.store.append_turn(&f.session, Turn::user_text("build a parser")).unwrap();
        let parent = Turn::assistant_text("done");
        let parent_id = parent.id.clone();
        f.store.append_turn(&f.session, parent).unwrap();

        let outcome = f.engine.summarize(&parent_id, &f.session, false).await.unwrap();

        let turns = f.store.turns(&f.session).unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last.id, outcome.summary_turn_id);
        assert!(last.has_summary());
        assert_eq!(last.text_content(), "we built the parser");
        assert!(outcome.tokens_before > 0);
    }

    #[tokio::test]
    async fn summarize_auto_appends_continue_turn() {
        let f = fixture(vec![MockResponse::text("summary")]);
        let parent = Turn::user_text("task");
        let parent_id = parent.id.clone();
        f.store.append_turn(&f.session, parent).unwrap();

        f.engine.summarize(&parent_id, &f.session, true).await.unwrap();

        let turns = f.store.turns(&f.session).unwrap();
        let last = turns.last().unwrap();
        assert!(last.is_user());
        assert_eq!(last.text_content(), "continue");
        assert!(turns[turns.len() - 2].has_summary());
    }

    #[tokio::test]
    async fn summarize_missing_parent_is_hard_error() {
        let f = fixture(vec![MockResponse::text("unused")]);
        f.store.append_turn(&f.session, Turn::user_text("hi")).unwrap();

        let result = f.engine.summarize(&TurnId::new(), &f.session, false).await;
        assert!(matches!(result, Err(EngineError::MissingParent(_))));
    }

    #[tokio::test]
    async fn summarize_propagates_model_failure() {
        let f = fixture(vec![MockResponse::Error(
            sable_core::errors::ProviderError::Overloaded,
        )]);
        let parent = Turn::user_text("task");
        let parent_id = parent.id.clone();
        f.store.append_turn(&f.session, parent).unwrap();

        let result = f.engine.summarize(&parent_id, &f.session, false).await;
        assert!(matches!(result, Err(EngineError::Provider(_))));
        // Nothing appended on failure: the session stays over budget.
        assert_eq!(f.store.turns(&f.session).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_within_budget_is_noop_under_budget() {
        let f = fixture(vec![]);
        let outcome = f
            .engine
            .ensure_within_budget(&f.session, &usage(1_000, 0, 100), false)
            .await
            .unwrap();
        assert!(matches!(outcome, CompactionOutcome::Untouched));
    }

    #[tokio::test]
    async fn ensure_within_budget_falls_back_to_summarization() {
        // Mock limits: context 200k, output 128k -> usable 168k. Usage far
        // beyond that and nothing prunable forces the summarize path.
        let f = fixture(vec![MockResponse::text("summary")]);
        f.store.append_turn(&f.session, Turn::user_text("task")).unwrap();

        let outcome = f
            .engine
            .ensure_within_budget(&f.session, &usage(300_000, 0, 10_000), true)
            .await
            .unwrap();
        assert!(matches!(outcome, CompactionOutcome::Summarized(_)));

        let turns = f.store.turns(&f.session).unwrap();
        assert!(turns.iter().any(Turn::has_summary));
    }
}
