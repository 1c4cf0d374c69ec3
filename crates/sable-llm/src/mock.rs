use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use sable_core::errors::ProviderError;
use sable_core::provider::{ByteStream, CallOptions, ModelClient, ModelLimits};
use sable_core::stream::ChunkParser;
use sable_core::turns::{Part, Role, Turn};

use crate::adapter::{collect_turn, AdapterStream, StreamAdapter};
use crate::sse::AnthropicSseParser;

/// Pre-programmed responses for deterministic tests without network access.
pub enum MockResponse {
    /// An assistant turn, rendered as SSE byte chunks when streamed so the
    /// full adapter + parser path is exercised.
    Turn(Turn),
    /// Raw byte chunks served verbatim.
    Chunks(Vec<Vec<u8>>),
    /// Fail the call itself.
    Error(ProviderError),
    /// Wait, then serve the inner response.
    Delayed(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Turn(Turn::assistant_text(text))
    }

    pub fn tool_call(call_id: &str, name: &str, input: serde_json::Value) -> Self {
        Self::Turn(Turn::new(
            Role::Assistant,
            vec![Part::ToolCall(sable_core::turns::ToolCallPart {
                call_id: sable_core::ids::CallId::from_raw(call_id),
                name: name.to_string(),
                input,
            })],
        ))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Mock model client serving responses in order. Calls past the end of the
/// script fail loudly instead of hanging.
pub struct MockClient {
    responses: Mutex<VecDeque<MockResponse>>,
    limits: ModelLimits,
    calls: Mutex<usize>,
}

impl MockClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            limits: ModelLimits {
                context_limit: 200_000,
                output_limit: 128_000,
                input_limit: None,
            },
            calls: Mutex::new(0),
        }
    }

    pub fn with_limits(mut self, limits: ModelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }

    async fn next_response(&self) -> Result<MockResponse, ProviderError> {
        *self.calls.lock() += 1;
        let mut response = self.responses.lock().pop_front().ok_or_else(|| {
            ProviderError::InvalidRequest("mock script exhausted".into())
        })?;
        while let MockResponse::Delayed(delay, inner) = response {
            tokio::time::sleep(delay).await;
            response = *inner;
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn limits(&self) -> ModelLimits {
        self.limits
    }

    async fn complete(
        &self,
        _turns: &[Turn],
        _options: &CallOptions,
    ) -> Result<Turn, ProviderError> {
        match self.next_response().await? {
            MockResponse::Turn(turn) => Ok(turn),
            MockResponse::Chunks(chunks) => {
                let bytes = chunk_stream(chunks);
                let stream = AdapterStream::new(bytes, StreamAdapter::new(self.chunk_parser()));
                let (turn, _) = collect_turn(stream).await?;
                Ok(turn)
            }
            MockResponse::Error(e) => Err(e),
            MockResponse::Delayed(..) => unreachable!("delays resolved in next_response"),
        }
    }

    async fn stream(
        &self,
        _turns: &[Turn],
        _options: &CallOptions,
    ) -> Result<ByteStream, ProviderError> {
        match self.next_response().await? {
            MockResponse::Turn(turn) => Ok(chunk_stream(sse_script(&turn))),
            MockResponse::Chunks(chunks) => Ok(chunk_stream(chunks)),
            MockResponse::Error(e) => Err(e),
            MockResponse::Delayed(..) => unreachable!("delays resolved in next_response"),
        }
    }

    fn chunk_parser(&self) -> Box<dyn ChunkParser> {
        Box::new(AnthropicSseParser::new())
    }
}

fn chunk_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
    let items: Vec<Result<bytes::Bytes, ProviderError>> =
        chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))).collect();
    Box::pin(futures::stream::iter(items))
}

/// Render an assistant turn as the SSE event sequence a live stream would
/// carry, one chunk per event.
pub fn sse_script(turn: &Turn) -> Vec<Vec<u8>> {
    let mut chunks: Vec<String> = Vec::new();

    chunks.push(sse_event(
        "message_start",
        &json!({"type": "message_start", "message": {"usage": {"input_tokens": 100}}}),
    ));

    let mut has_tool_calls = false;
    for (index, part) in turn.parts.iter().enumerate() {
        match part {
            Part::Text { text } | Part::Summary { text } => {
                chunks.push(sse_event(
                    "content_block_start",
                    &json!({"type": "content_block_start", "index": index,
                            "content_block": {"type": "text", "text": ""}}),
                ));
                chunks.push(sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": index,
                            "delta": {"type": "text_delta", "text": text}}),
                ));
                chunks.push(sse_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": index}),
                ));
            }
            Part::Reasoning { text, signature } => {
                chunks.push(sse_event(
                    "content_block_start",
                    &json!({"type": "content_block_start", "index": index,
                            "content_block": {"type": "thinking", "thinking": ""}}),
                ));
                chunks.push(sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": index,
                            "delta": {"type": "thinking_delta", "thinking": text}}),
                ));
                if let Some(sig) = signature {
                    chunks.push(sse_event(
                        "content_block_delta",
                        &json!({"type": "content_block_delta", "index": index,
                                "delta": {"type": "signature_delta", "signature": sig}}),
                    ));
                }
                chunks.push(sse_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": index}),
                ));
            }
            Part::ToolCall(tc) => {
                has_tool_calls = true;
                chunks.push(sse_event(
                    "content_block_start",
                    &json!({"type": "content_block_start", "index": index,
                            "content_block": {"type": "tool_use",
                                              "id": tc.call_id.as_str(),
                                              "name": tc.name}}),
                ));
                chunks.push(sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": index,
                            "delta": {"type": "input_json_delta",
                                      "partial_json": tc.input.to_string()}}),
                ));
                chunks.push(sse_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": index}),
                ));
            }
            Part::ToolOutput(_) => {}
        }
    }

    let stop_reason = if has_tool_calls { "tool_use" } else { "end_turn" };
    chunks.push(sse_event(
        "message_delta",
        &json!({"type": "message_delta", "delta": {"stop_reason": stop_reason},
                "usage": {"output_tokens": 50}}),
    ));
    chunks.push(sse_event("message_stop", &json!({"type": "message_stop"})));

    chunks.into_iter().map(String::into_bytes).collect()
}

fn sse_event(event: &str, data: &serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}
