use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use sable_core::errors::ProviderError;
use sable_core::provider::{ByteStream, CallOptions, ModelClient, ModelLimits};
use sable_core::stream::ChunkParser;
use sable_core::turns::{Part, Role, Turn};

use crate::adapter::{collect_turn, AdapterStream, StreamAdapter};
use crate::models::{self, ModelSpec};
use crate::sse::AnthropicSseParser;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// API key with redacted `Debug`.
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }
}

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: ApiKey,
    model: &'static ModelSpec,
}

impl AnthropicClient {
    pub fn new(api_key: ApiKey, model_name: Option<&str>) -> Result<Self, ProviderError> {
        let model = model_name
            .and_then(models::find_model)
            .unwrap_or_else(models::default_model);

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self { client, api_key, model })
    }

    fn request_body(&self, turns: &[Turn], options: &CallOptions) -> Value {
        let mut body = json!({
            "model": self.model.name,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
            "messages": turns.iter().map(turn_to_message).collect::<Vec<Value>>(),
        });

        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if !options.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(options.stop_sequences);
        }
        if !options.tools.is_empty() {
            body["tools"] = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters_schema,
                    })
                })
                .collect();
        }

        body
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        self.model.name
    }

    fn limits(&self) -> ModelLimits {
        self.model.limits
    }

    async fn complete(
        &self,
        turns: &[Turn],
        options: &CallOptions,
    ) -> Result<Turn, ProviderError> {
        let bytes = self.stream(turns, options).await?;
        let adapter = StreamAdapter::new(self.chunk_parser());
        let stream = AdapterStream::new(bytes, adapter).with_idle_timeout(IDLE_TIMEOUT);
        let (turn, _usage) = collect_turn(stream).await?;
        Ok(turn)
    }

    #[instrument(skip(self, turns, options), fields(model = %self.model.name))]
    async fn stream(
        &self,
        turns: &[Turn],
        options: &CallOptions,
    ) -> Result<ByteStream, ProviderError> {
        let body = self.request_body(turns, options);

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.0.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let stream = resp
            .bytes_stream()
            .map(|item| item.map_err(|e| ProviderError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(stream))
    }

    fn chunk_parser(&self) -> Box<dyn ChunkParser> {
        Box::new(AnthropicSseParser::new())
    }
}

/// Map one conversation turn to an Anthropic message object. Tool turns
/// become user-role `tool_result` blocks, per the messages API contract.
fn turn_to_message(turn: &Turn) -> Value {
    match turn.role {
        Role::User => json!({
            "role": "user",
            "content": [{"type": "text", "text": turn.text_content()}],
        }),
        Role::Assistant => {
            let content: Vec<Value> = turn
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } | Part::Summary { text } => {
                        Some(json!({"type": "text", "text": text}))
                    }
                    Part::Reasoning { text, signature } => Some(json!({
                        "type": "thinking",
                        "thinking": text,
                        "signature": signature,
                    })),
                    Part::ToolCall(tc) => Some(json!({
                        "type": "tool_use",
                        "id": tc.call_id.as_str(),
                        "name": tc.name,
                        "input": tc.input,
                    })),
                    Part::ToolOutput(_) => None,
                })
                .collect();
            json!({"role": "assistant", "content": content})
        }
        Role::Tool => {
            let content: Vec<Value> = turn
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::ToolOutput(out) => Some(json!({
                        "type": "tool_result",
                        "tool_use_id": out.call_id.as_str(),
                        "content": effective_output(out),
                    })),
                    _ => None,
                })
                .collect();
            json!({"role": "user", "content": content})
        }
    }
}

/// Pruned tool outputs are sent as a placeholder, not the original content.
fn effective_output(out: &sable_core::turns::ToolOutputPart) -> String {
    if out.compacted_at.is_some() {
        "[output pruned to fit context]".to_string()
    } else {
        out.output.clone()
    }
}
