use std::pin::Pin;

use async_trait::async_trait;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::events::UsageData;
use crate::messages::{ContentBlock, Message};
use crate::tools::ToolDefinition;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Options controlling a single model call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompleteOptions {
    pub tools: Vec<ToolDefinition>,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for CompleteOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            system: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn to_data(self) -> UsageData {
        UsageData {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            usage: None,
        }
    }
}

/// Everything `pre_model` hooks may rewrite before the call goes out.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub options: CompleteOptions,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    TextDelta { delta: String },
    Done { response: ModelResponse },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Trait implemented by each model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompleteOptions,
    ) -> Result<ModelResponse, ProviderError>;

    /// Streaming variant. Providers without native streaming yield each text
    /// block as one delta followed by `Done`.
    async fn stream(
        &self,
        messages: &[Message],
        options: &CompleteOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.complete(messages, options).await?;
        let mut chunks: Vec<Result<StreamChunk, ProviderError>> = response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } if !text.is_empty() => {
                    Some(Ok(StreamChunk::TextDelta { delta: text.clone() }))
                }
                _ => None,
            })
            .collect();
        chunks.push(Ok(StreamChunk::Done { response }));
        Ok(Box::pin(stream::iter(chunks)))
    }
}
