//! The model capability the agent talks to.
//!
//! Every provider (OpenAI-compatible, Vertex-style, custom endpoint, scripted
//! replay) implements [`Generator`]. The state machine only ever sees a stream
//! of [`StreamChunk`]s: text tokens as they arrive, tool calls once complete.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::errors::InferenceError;
use super::types::{ChatMessage, StreamChunk, ToolCall, ToolDefinition};

/// Boxed chunk stream returned by [`Generator::generate`].
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

/// A model that can continue a conversation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start a generation over `messages`.
    ///
    /// When `tools` is `Some`, the model may answer with tool calls instead of
    /// (or after) text. Errors opening the request are returned directly;
    /// errors mid-stream arrive as stream items.
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError>;
}

/// A fully collected generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Generation {
    /// Fold one chunk into the accumulated result.
    pub fn absorb(&mut self, chunk: StreamChunk) {
        if let Some(token) = chunk.token {
            self.text.push_str(&token);
        }
        if let Some(calls) = chunk.tool_calls {
            self.tool_calls.extend(calls);
        }
    }
}

/// Run a generation to completion without streaming tokens anywhere.
///
/// Used by the tool executors, whose model calls are internal to the tool.
pub async fn complete(
    generator: &dyn Generator,
    messages: Vec<ChatMessage>,
) -> Result<Generation, InferenceError> {
    let mut stream = generator.generate(messages, None).await?;
    let mut generation = Generation::default();
    while let Some(chunk) = stream.next().await {
        generation.absorb(chunk?);
    }
    Ok(generation)
}
