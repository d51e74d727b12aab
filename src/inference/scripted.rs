//! Scripted replay generator.
//!
//! Replays a fixed queue of model outcomes. Used for offline demos and by the
//! test suites to drive the agent without a model server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use super::errors::InferenceError;
use super::generator::{ChunkStream, Generator};
use super::types::{ChatMessage, StreamChunk, ToolCall, ToolDefinition};

/// One canned model outcome.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream `text` word by word, then stop.
    Reply(String),
    /// Answer with tool calls (no text).
    CallTools(Vec<ToolCall>),
    /// Fail before any chunk is produced.
    Fail(String),
    /// Stream `partial`, then fail.
    FailMidStream { partial: String },
    /// Wait for the notify before running the inner step.
    Gated(Arc<Notify>, Box<ScriptStep>),
}

impl ScriptStep {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    /// A single tool call with a generated id.
    pub fn call(name: &str, arguments: serde_json::Value) -> Self {
        Self::CallTools(vec![ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            arguments,
        }])
    }
}

/// Generator that replays [`ScriptStep`]s in order.
///
/// Records every request it receives so callers can assert on prompts.
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    /// Append a step to the end of the script.
    pub fn push(&self, step: ScriptStep) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Steps not yet consumed.
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Message lists received, in call order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_step(&self) -> Option<ScriptStep> {
        self.steps.lock().ok().and_then(|mut s| s.pop_front())
    }
}

fn word_chunks(text: &str) -> Vec<Result<StreamChunk, InferenceError>> {
    text.split_inclusive(' ')
        .map(|piece| Ok(StreamChunk::token(piece)))
        .collect()
}

async fn play(mut step: ScriptStep) -> Result<ChunkStream, InferenceError> {
    loop {
        match step {
            ScriptStep::Gated(gate, inner) => {
                gate.notified().await;
                step = *inner;
            }
            ScriptStep::Reply(text) => {
                let mut items = word_chunks(&text);
                items.push(Ok(StreamChunk {
                    finish_reason: Some("stop".into()),
                    ..StreamChunk::default()
                }));
                return Ok(stream::iter(items).boxed());
            }
            ScriptStep::CallTools(calls) => {
                return Ok(stream::iter(vec![Ok(StreamChunk {
                    token: None,
                    tool_calls: Some(calls),
                    finish_reason: Some("tool_calls".into()),
                })])
                .boxed())
            }
            ScriptStep::Fail(reason) => {
                return Err(InferenceError::ConnectionFailed {
                    endpoint: "scripted".into(),
                    reason,
                })
            }
            ScriptStep::FailMidStream { partial } => {
                let mut items = word_chunks(&partial);
                items.push(Err(InferenceError::StreamError {
                    reason: "scripted stream interruption".into(),
                }));
                return Ok(stream::iter(items).boxed());
            }
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages);
        }
        match self.next_step() {
            Some(step) => play(step).await,
            None => Err(InferenceError::StreamError {
                reason: "script exhausted".into(),
            }),
        }
    }
}
