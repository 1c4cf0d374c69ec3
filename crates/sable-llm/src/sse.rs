use serde::Deserialize;
use serde_json::Value;

use sable_core::errors::ProviderError;
use sable_core::ids::CallId;
use sable_core::stream::{ChunkParser, FinishReason, StreamEvent};
use sable_core::turns::{Part, Role, ToolCallPart, Turn};
use sable_core::usage::UsageUpdate;

/// Chunk parser for the Anthropic SSE framing. Segments are separated by a
/// blank line and carry `event:` / `data:` fields. Content blocks arrive as
/// start/delta/stop triples keyed by index; the parser assembles them and
/// emits the finished assistant turn on `message_stop`.
pub struct AnthropicSseParser {
    blocks: Vec<(usize, Block)>,
    stop_reason: Option<FinishReason>,
}

enum Block {
    Text { text: String },
    Reasoning { text: String, signature: Option<String> },
    Tool { id: String, name: String, arguments_json: String },
}

impl Default for AnthropicSseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicSseParser {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            stop_reason: None,
        }
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, b)| b)
    }

    fn handle_event(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        match event_type {
            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    let block = match start.content_block.get("type").and_then(Value::as_str) {
                        Some("text") => Some(Block::Text { text: String::new() }),
                        Some("thinking") => Some(Block::Reasoning {
                            text: String::new(),
                            signature: None,
                        }),
                        Some("tool_use") => {
                            let id = start
                                .content_block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            let name = start
                                .content_block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            Some(Block::Tool { id, name, arguments_json: String::new() })
                        }
                        _ => None,
                    };
                    if let Some(block) = block {
                        self.blocks.push((start.index, block));
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(event) = serde_json::from_str::<ContentBlockDelta>(data) {
                    let index = event.index;
                    match event.delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            let delta = event
                                .delta
                                .get("text")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            if let Some(Block::Text { text }) = self.block_mut(index) {
                                text.push_str(&delta);
                            }
                            events.push(StreamEvent::TextDelta { id: index.to_string(), delta });
                        }
                        Some("thinking_delta") => {
                            let delta = event
                                .delta
                                .get("thinking")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            if let Some(Block::Reasoning { text, .. }) = self.block_mut(index) {
                                text.push_str(&delta);
                            }
                            events.push(StreamEvent::ReasoningDelta { id: index.to_string(), delta });
                        }
                        Some("input_json_delta") => {
                            let partial = event
                                .delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if let Some(Block::Tool { arguments_json, .. }) = self.block_mut(index) {
                                arguments_json.push_str(partial);
                            }
                        }
                        Some("signature_delta") => {
                            let sig = event
                                .delta
                                .get("signature")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if let Some(Block::Reasoning { signature, .. }) = self.block_mut(index) {
                                match signature {
                                    Some(existing) => existing.push_str(sig),
                                    None => *signature = Some(sig.to_string()),
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            "content_block_stop" => {
                if let Ok(stop) = serde_json::from_str::<ContentBlockStop>(data) {
                    if let Some(Block::Tool { id, name, arguments_json }) = self.block_mut(stop.index)
                    {
                        let input: Value = serde_json::from_str(arguments_json)
                            .unwrap_or(Value::Object(serde_json::Map::new()));
                        events.push(StreamEvent::ToolCall {
                            call: ToolCallPart {
                                call_id: CallId::from_raw(id.as_str()),
                                name: name.clone(),
                                input,
                            },
                        });
                    }
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    if let Some(reason) = delta.delta.and_then(|d| d.stop_reason) {
                        self.stop_reason = Some(map_stop_reason(&reason));
                    }
                }
            }

            "message_stop" => {
                let turn = self.build_turn();
                let reason = self.stop_reason.unwrap_or_else(|| {
                    if turn.has_tool_calls() {
                        FinishReason::ToolUse
                    } else {
                        FinishReason::EndTurn
                    }
                });
                events.push(StreamEvent::Finish { reason, turn });
            }

            "error" => {
                if let Ok(err) = serde_json::from_str::<ErrorEvent>(data) {
                    events.push(StreamEvent::Error { error: classify_error(&err) });
                }
            }

            // message_start carries usage only (handled by parse_usage); ping
            // and unknown event types are ignored.
            _ => {}
        }

        events
    }

    fn build_turn(&self) -> Turn {
        let mut parts = Vec::new();
        for (_, block) in &self.blocks {
            match block {
                Block::Text { text } => parts.push(Part::Text { text: text.clone() }),
                Block::Reasoning { text, signature } => parts.push(Part::Reasoning {
                    text: text.clone(),
                    signature: signature.clone(),
                }),
                Block::Tool { id, name, arguments_json } => {
                    let input: Value = serde_json::from_str(arguments_json)
                        .unwrap_or(Value::Object(serde_json::Map::new()));
                    parts.push(Part::ToolCall(ToolCallPart {
                        call_id: CallId::from_raw(id.as_str()),
                        name: name.clone(),
                        input,
                    }));
                }
            }
        }
        Turn::new(Role::Assistant, parts)
    }
}

impl ChunkParser for AnthropicSseParser {
    fn separator(&self) -> &str {
        "\n\n"
    }

    fn parse_usage(&mut self, segment: &str) -> Option<UsageUpdate> {
        for (event_type, data) in split_sse_fields(segment) {
            let usage = match event_type.as_str() {
                "message_start" => serde_json::from_str::<MessageStart>(&data)
                    .ok()
                    .and_then(|m| m.message.usage),
                "message_delta" => serde_json::from_str::<MessageDelta>(&data)
                    .ok()
                    .and_then(|m| m.usage),
                _ => None,
            };
            if let Some(u) = usage {
                return Some(UsageUpdate {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                    reasoning_tokens: None,
                    cache_read_tokens: u.cache_read_input_tokens,
                    cache_write_tokens: u.cache_creation_input_tokens,
                });
            }
        }
        None
    }

    fn parse_segment(&mut self, segment: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (event_type, data) in split_sse_fields(segment) {
            events.extend(self.handle_event(&event_type, &data));
        }
        events
    }
}

/// Parse one SSE segment into `(event, data)` pairs. Lines that are neither
/// field are skipped; a trailing pair without a blank line still counts.
fn split_sse_fields(segment: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut event = String::new();
    let mut data = String::new();

    for line in segment.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = rest.to_string();
        } else if line.is_empty() && !event.is_empty() {
            pairs.push((std::mem::take(&mut event), std::mem::take(&mut data)));
        }
    }
    if !event.is_empty() {
        pairs.push((event, data));
    }
    pairs
}

fn map_stop_reason(raw: &str) -> FinishReason {
    match raw {
        "tool_use" => FinishReason::ToolUse,
        "max_tokens" => FinishReason::MaxTokens,
        "stop_sequence" => FinishReason::StopSequence,
        _ => FinishReason::EndTurn,
    }
}

fn classify_error(err: &ErrorEvent) -> ProviderError {
    match err.error.error_type.as_str() {
        "overloaded_error" => ProviderError::Overloaded,
        "rate_limit_error" => ProviderError::RateLimited { retry_after: None },
        "authentication_error" => ProviderError::AuthenticationFailed(err.error.message.clone()),
        "invalid_request_error" => ProviderError::InvalidRequest(err.error.message.clone()),
        _ => ProviderError::ServerError { status: 500, body: err.error.message.clone() },
    }
}

// --- Deserialization types for the SSE payloads ---

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(event: &str, data: &str) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    #[test]
    fn text_stream_assembles_turn() {
        let mut parser = AnthropicSseParser::new();

        let events = parser.parse_segment(&seg(
            "message_start",
            r#"{"type":"message_start","message":{"usage":{"input_tokens":100}}}"#,
        ));
        assert!(events.is_empty());

        parser.parse_segment(&seg(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ));

        let events = parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta, .. } if delta == "Hello"));

        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" world"}}"#,
        ));
        parser.parse_segment(&seg("content_block_stop", r#"{"type":"content_block_stop","index":0}"#));
        parser.parse_segment(&seg(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#,
        ));

        let events = parser.parse_segment(&seg("message_stop", r#"{"type":"message_stop"}"#));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Finish { reason, turn } => {
                assert_eq!(*reason, FinishReason::EndTurn);
                assert_eq!(turn.text_content(), "Hello world");
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn tool_use_stream() {
        let mut parser = AnthropicSseParser::new();
        parser.parse_segment(&seg(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"call_abc","name":"read"}}"#,
        ));
        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\""}}"#,
        ));
        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":":\"/tmp/a\"}"}}"#,
        ));

        let events =
            parser.parse_segment(&seg("content_block_stop", r#"{"type":"content_block_stop","index":0}"#));
        match &events[0] {
            StreamEvent::ToolCall { call } => {
                assert_eq!(call.name, "read");
                assert_eq!(call.call_id.as_str(), "call_abc");
                assert_eq!(call.input["path"], "/tmp/a");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }

        let events = parser.parse_segment(&seg("message_stop", r#"{"type":"message_stop"}"#));
        match &events[0] {
            StreamEvent::Finish { reason, turn } => {
                assert_eq!(*reason, FinishReason::ToolUse);
                assert_eq!(turn.tool_calls().len(), 1);
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_blocks_keep_signature() {
        let mut parser = AnthropicSseParser::new();
        parser.parse_segment(&seg(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
        ));
        let events = parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"mull"}}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::ReasoningDelta { delta, .. } if delta == "mull"));

        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_1"}}"#,
        ));
        parser.parse_segment(&seg("content_block_stop", r#"{"type":"content_block_stop","index":0}"#));

        let events = parser.parse_segment(&seg("message_stop", r#"{"type":"message_stop"}"#));
        if let StreamEvent::Finish { turn, .. } = &events[0] {
            assert!(matches!(
                &turn.parts[0],
                Part::Reasoning { text, signature }
                    if text == "mull" && signature.as_deref() == Some("sig_1")
            ));
        } else {
            panic!("expected Finish");
        }
    }

    #[test]
    fn usage_from_message_start_and_delta() {
        let mut parser = AnthropicSseParser::new();
        let update = parser
            .parse_usage(&seg(
                "message_start",
                r#"{"type":"message_start","message":{"usage":{"input_tokens":500,"cache_read_input_tokens":200,"cache_creation_input_tokens":100}}}"#,
            ))
            .unwrap();
        assert_eq!(update.input_tokens, Some(500));
        assert_eq!(update.cache_read_tokens, Some(200));
        assert_eq!(update.cache_write_tokens, Some(100));

        let update = parser
            .parse_usage(&seg(
                "message_delta",
                r#"{"type":"message_delta","usage":{"output_tokens":300}}"#,
            ))
            .unwrap();
        assert_eq!(update.output_tokens, Some(300));
        assert_eq!(update.input_tokens, None);
    }

    #[test]
    fn usage_absent_for_content_segments() {
        let mut parser = AnthropicSseParser::new();
        assert!(parser
            .parse_usage(&seg(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"x"}}"#,
            ))
            .is_none());
    }

    #[test]
    fn error_events_classified() {
        let mut parser = AnthropicSseParser::new();
        let events = parser.parse_segment(&seg(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.is_retryable()));

        let events = parser.parse_segment(&seg(
            "error",
            r#"{"type":"error","error":{"type":"authentication_error","message":"bad key"}}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.is_fatal()));
    }

    #[test]
    fn malformed_data_yields_no_events() {
        let mut parser = AnthropicSseParser::new();
        let events = parser.parse_segment("event: content_block_start\ndata: {not json}\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn split_sse_fields_handles_trailing_pair() {
        let pairs = split_sse_fields("event: message_start\ndata: {}\n\nevent: ping\ndata: {}");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "message_start");
        assert_eq!(pairs[1].0, "ping");
    }

    #[test]
    fn interleaved_blocks_preserve_order() {
        let mut parser = AnthropicSseParser::new();
        parser.parse_segment(&seg(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
        ));
        parser.parse_segment(&seg(
            "content_block_start",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
        ));
        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"answer"}}"#,
        ));
        parser.parse_segment(&seg(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"think"}}"#,
        ));

        let events = parser.parse_segment(&seg("message_stop", r#"{"type":"message_stop"}"#));
        if let StreamEvent::Finish { turn, .. } = &events[0] {
            assert!(matches!(&turn.parts[0], Part::Reasoning { text, .. } if text == "think"));
            assert!(matches!(&turn.parts[1], Part::Text { text } if text == "answer"));
        } else {
            panic!("expected Finish");
        }
    }
}
