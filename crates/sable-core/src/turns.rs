use serde::{Deserialize, Serialize};

use crate::ids::{CallId, TurnId};
use crate::tools::ToolStatus;

/// One message in a conversation. Owned by session storage; the engine
/// reads turns and the compaction pass marks parts, it never deletes them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub parts: Vec<Part>,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "reasoning")]
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallPart),
    #[serde(rename = "tool_output")]
    ToolOutput(ToolOutputPart),
    /// Marks an assistant turn as a compaction anchor. Pruning scans stop
    /// here: everything older is already covered by the summary.
    #[serde(rename = "summary")]
    Summary { text: String },
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub call_id: CallId,
    pub name: String,
    pub input: serde_json::Value,
}

/// The recorded outcome of a tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutputPart {
    pub call_id: CallId,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
    /// Compaction tombstone. Set instead of deleting the output so the
    /// audit trail survives pruning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<String>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: TurnId::new(),
            role,
            parts,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::Text { text: text.into() }])
    }

    pub fn tool_output(part: ToolOutputPart) -> Self {
        Self::new(Role::Tool, vec![Part::ToolOutput(part)])
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn has_summary(&self) -> bool {
        self.role == Role::Assistant
            && self.parts.iter().any(|p| matches!(p, Part::Summary { .. }))
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall(_)))
    }

    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } | Part::Summary { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Coarse token estimate for budget decisions (4 chars per token).
    pub fn estimated_tokens(&self) -> u64 {
        self.parts.iter().map(Part::estimated_tokens).sum()
    }
}

impl Part {
    pub fn estimated_tokens(&self) -> u64 {
        match self {
            Part::Text { text } | Part::Summary { text } => estimate_text_tokens(text),
            Part::Reasoning { text, .. } => estimate_text_tokens(text),
            Part::ToolCall(tc) => {
                estimate_text_tokens(&tc.name) + estimate_text_tokens(&tc.input.to_string())
            }
            Part::ToolOutput(out) => estimate_text_tokens(&out.output),
        }
    }
}

/// chars / 4. Good enough for pruning decisions; never used for billing.
pub fn estimate_text_tokens(text: &str) -> u64 {
    text.len() as u64 / 4
}
