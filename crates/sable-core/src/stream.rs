use crate::errors::ProviderError;
use crate::ids::CallId;
use crate::turns::{ToolCallPart, Turn};
use crate::usage::UsageUpdate;

/// Typed events produced by the streaming adapter. Deltas for one content
/// block share an `id`; source chunk order is preserved exactly.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    TextDelta { id: String, delta: String },
    ReasoningDelta { id: String, delta: String },
    /// A fully assembled tool-call intent.
    ToolCall { call: ToolCallPart },
    /// A provider-side tool result echoed back through the stream.
    ToolResult { call_id: CallId, output: String, is_error: bool },
    Finish { reason: FinishReason, turn: Turn },
    Error { error: ProviderError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. } | Self::ReasoningDelta { .. })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("chunk decode failed: {0}")]
pub struct ChunkDecodeError(pub String);

/// Per-provider hooks the streaming adapter is parameterized with. One
/// parser instance serves one stream; implementations may keep block state
/// across segments.
pub trait ChunkParser: Send {
    /// Segment separator in the provider's framing (`"\n\n"` for SSE).
    fn separator(&self) -> &str;

    /// Optional binary pre-decoder for framed envelopes. `Ok(None)` drops
    /// the chunk silently; an error is logged by the adapter and the chunk
    /// skipped — never fatal to the stream.
    fn decode_chunk(&mut self, raw: &[u8]) -> Result<Option<String>, ChunkDecodeError> {
        Ok(Some(String::from_utf8_lossy(raw).into_owned()))
    }

    /// Cross-provider normalization applied to a segment before event
    /// parsing. `None` means "use the segment as-is".
    fn convert_segment(&self, _segment: &str) -> Option<String> {
        None
    }

    /// Extract usage counters from one segment, if it carries any.
    fn parse_usage(&mut self, segment: &str) -> Option<UsageUpdate>;

    /// Parse one segment into typed events. Malformed segments yield no
    /// events and no error.
    fn parse_segment(&mut self, segment: &str) -> Vec<StreamEvent>;
}
