use serde::{Deserialize, Serialize};

use crate::ids::{CallId, SessionId};
use crate::usage::UsageInfo;

/// Lifecycle notifications published on the engine's broadcast bus.
///
/// Ordering contract: within one `call_id`, `ToolStarted` precedes the single
/// terminal `ToolCompleted`/`ToolError`. Across call ids there is no ordering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "turn_started")]
    TurnStarted {
        session_id: SessionId,
        turn: u32,
    },

    #[serde(rename = "text_delta")]
    TextDelta {
        session_id: SessionId,
        delta: String,
    },

    #[serde(rename = "reasoning_delta")]
    ReasoningDelta {
        session_id: SessionId,
        delta: String,
    },

    #[serde(rename = "tool_started")]
    ToolStarted {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
    },

    #[serde(rename = "tool_completed")]
    ToolCompleted {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
        output_preview: String,
        duration_ms: u64,
    },

    #[serde(rename = "tool_error")]
    ToolError {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
        reason: String,
    },

    /// Heuristic warning: the model repeated an identical tool input.
    /// Policy response is decided by the permission layer, not here.
    #[serde(rename = "doom_loop")]
    DoomLoop {
        session_id: SessionId,
        tool_name: String,
    },

    #[serde(rename = "turn_complete")]
    TurnComplete {
        session_id: SessionId,
        turn: u32,
        usage: UsageInfo,
    },

    #[serde(rename = "session_complete")]
    SessionComplete {
        session_id: SessionId,
    },

    #[serde(rename = "compaction_started")]
    CompactionStarted {
        session_id: SessionId,
    },

    #[serde(rename = "compaction_complete")]
    CompactionComplete {
        session_id: SessionId,
        tokens_before: u64,
        tokens_after: u64,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStarted { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolCompleted { session_id, .. }
            | Self::ToolError { session_id, .. }
            | Self::DoomLoop { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::SessionComplete { session_id }
            | Self::CompactionStarted { session_id }
            | Self::CompactionComplete { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ToolError { .. } => "tool_error",
            Self::DoomLoop { .. } => "doom_loop",
            Self::TurnComplete { .. } => "turn_complete",
            Self::SessionComplete { .. } => "session_complete",
            Self::CompactionStarted { .. } => "compaction_started",
            Self::CompactionComplete { .. } => "compaction_complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_accessor() {
        let sid = SessionId::new();
        let evt = EngineEvent::ToolStarted {
            session_id: sid.clone(),
            call_id: CallId::new(),
            tool_name: "bash".into(),
        };
        assert_eq!(evt.session_id(), &sid);
        assert_eq!(evt.event_type(), "tool_started");
    }

    #[test]
    fn serde_roundtrip() {
        let events = vec![
            EngineEvent::TurnStarted { session_id: SessionId::new(), turn: 1 },
            EngineEvent::ToolError {
                session_id: SessionId::new(),
                call_id: CallId::new(),
                tool_name: "bash".into(),
                reason: "cancelled".into(),
            },
            EngineEvent::CompactionComplete {
                session_id: SessionId::new(),
                tokens_before: 90_000,
                tokens_after: 30_000,
            },
        ];
        for evt in &events {
            let json = serde_json::to_string(evt).unwrap();
            let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(json, serde_json::to_string(&parsed).unwrap());
        }
    }
}
