use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::stream::ChunkParser;
use crate::tools::ToolDefinition;
use crate::turns::Turn;

/// Raw incremental output of a model call, before the streaming adapter.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Token limits a model advertises. `input_limit` is only set for providers
/// that declare a separate input budget; otherwise the usable input window is
/// derived from `context_limit` minus reserved output.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context_limit: u64,
    pub output_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_limit: Option<u64>,
}

/// Options for one model call.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<ToolDefinition>,
}

/// Trait implemented by each model provider client.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn limits(&self) -> ModelLimits;

    /// Issue a call and return the complete assistant turn. Used where the
    /// caller has no interest in increments (summarization).
    async fn complete(
        &self,
        turns: &[Turn],
        options: &CallOptions,
    ) -> Result<Turn, ProviderError>;

    /// Issue a call and return the raw byte stream for the adapter.
    async fn stream(
        &self,
        turns: &[Turn],
        options: &CallOptions,
    ) -> Result<ByteStream, ProviderError>;

    /// Fresh parser for one stream returned by [`ModelClient::stream`].
    fn chunk_parser(&self) -> Box<dyn ChunkParser>;
}
