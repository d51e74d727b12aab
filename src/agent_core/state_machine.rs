//! Agent State Machine.
//!
//! One turn alternates between an ASSISTANT step (ask the model) and a TOOLS
//! step (run the calls it requested, in order) until the model answers in
//! plain text (DONE) or something fatal happens (FAILED).
//!
//! The checkpoint is saved after every transition. A TOOLS checkpoint records
//! the index of the first call without a result, so resuming never re-runs a
//! tool or re-asks the model for calls it already made.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connections::ConnectionManager;
use crate::inference::generator::{Generation, Generator};
use crate::inference::types::ChatMessage;
use crate::inference::{InferenceError, ModelRegistry};

use super::errors::AgentError;
use super::prompts;
use super::store::CheckpointStore;
use super::tool_router::{ToolContext, ToolError, ToolRouter};
use super::types::{AgentState, Checkpoint, Message, Thread, TurnEvent, TurnPhase};

// ─── Settings ───────────────────────────────────────────────────────────────

/// `agent:` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// ASSISTANT→TOOLS transitions allowed per turn.
    pub max_round_trips: u32,
    pub model_retry_backoff_ms: u64,
    pub model_timeout_secs: u64,
    /// Events buffered between the turn task and the stream consumer.
    pub event_buffer: usize,
    /// Tool messages longer than this are clipped in the model context.
    pub max_tool_message_bytes: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_round_trips: 6,
            model_retry_backoff_ms: 500,
            model_timeout_secs: 180,
            event_buffer: 64,
            max_tool_message_bytes: 8_000,
        }
    }
}

impl AgentSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.model_retry_backoff_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

// ─── State Machine ──────────────────────────────────────────────────────────

/// Runs turns. Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct AgentStateMachine {
    registry: Arc<ModelRegistry>,
    connections: Arc<ConnectionManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    router: Arc<ToolRouter>,
    settings: AgentSettings,
}

impl AgentStateMachine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        connections: Arc<ConnectionManager>,
        checkpoints: Arc<dyn CheckpointStore>,
        router: Arc<ToolRouter>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            registry,
            connections,
            checkpoints,
            router,
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run the checkpoint to a terminal phase.
    ///
    /// Returns the final checkpoint and the terminal event (`End` or
    /// `Error`). The caller sends it last, after releasing the thread.
    pub async fn drive(
        &self,
        thread: &Thread,
        mut checkpoint: Checkpoint,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> (Checkpoint, TurnEvent) {
        let started = Instant::now();
        let terminal = match self.run(thread, &mut checkpoint, events, cancel).await {
            Ok(full_response) => {
                tracing::info!(
                    thread_id = %thread.id,
                    rounds = checkpoint.round,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn completed"
                );
                TurnEvent::End { full_response }
            }
            Err(e) => {
                tracing::warn!(
                    thread_id = %thread.id,
                    kind = e.kind(),
                    error = %e,
                    rounds = checkpoint.round,
                    "turn failed"
                );
                checkpoint.phase = TurnPhase::Failed {
                    error: e.client_message(),
                };
                if let Err(save_err) = self.save(&mut checkpoint) {
                    tracing::error!(thread_id = %thread.id, error = %save_err, "failed to save failed checkpoint");
                }
                TurnEvent::Error(e)
            }
        };
        (checkpoint, terminal)
    }

    /// Step until the checkpoint is terminal. Returns the streamed text.
    pub async fn run(
        &self,
        thread: &Thread,
        checkpoint: &mut Checkpoint,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut full_response = String::new();
        loop {
            match checkpoint.phase.clone() {
                TurnPhase::Assistant => {
                    self.assistant_step(thread, checkpoint, events, cancel, &mut full_response)
                        .await?
                }
                TurnPhase::Tools { next } => {
                    self.tools_step(thread, checkpoint, next, events, cancel).await?
                }
                TurnPhase::Idle | TurnPhase::Done | TurnPhase::Failed { .. } => {
                    return Ok(full_response)
                }
            }
        }
    }

    /// The thread's model (or the default) bound to its generator.
    fn bind_model(&self, thread: &Thread) -> Result<(String, Arc<dyn Generator>), AgentError> {
        let selected = self
            .registry
            .select(thread.model_name.as_deref())
            .ok_or(AgentError::NoModelSelected)?;
        self.registry
            .generator(selected)
            .map_err(|e| AgentError::from_inference(selected, e))
    }

    fn context(&self, state: &AgentState) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(prompts::system_prompt(
            state.db_schema_snapshot.as_deref(),
            state.last_query_result.as_ref(),
        ))];
        messages.extend(
            state
                .messages
                .iter()
                .map(|m| m.to_chat_message(self.settings.max_tool_message_bytes)),
        );
        messages
    }

    fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), AgentError> {
        checkpoint.updated_at = Utc::now();
        self.checkpoints.save_checkpoint(checkpoint)
    }

    // ── ASSISTANT ──────────────────────────────────────────────────────────

    async fn assistant_step(
        &self,
        thread: &Thread,
        checkpoint: &mut Checkpoint,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        full_response: &mut String,
    ) -> Result<(), AgentError> {
        let (model, generator) = self.bind_model(thread)?;
        checkpoint.state.model_name = Some(model.clone());
        let messages = self.context(&checkpoint.state);

        tracing::info!(
            thread_id = %thread.id,
            model = %model,
            round = checkpoint.round,
            message_count = messages.len(),
            "assistant step"
        );

        let mut attempt = 0u32;
        let generation = loop {
            attempt += 1;
            let mut emitted = false;
            let run = tokio::time::timeout(
                self.settings.model_timeout(),
                stream_generation(&*generator, messages.clone(), events, &mut emitted, full_response),
            );
            let result = tokio::select! {
                r = run => r.unwrap_or_else(|_| Err(InferenceError::Timeout {
                    duration_secs: self.settings.model_timeout_secs,
                })),
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            };

            match result {
                Ok(generation) => break generation,
                // Text already reached the client; a retry would duplicate it.
                Err(e) if attempt < 2 && !emitted => {
                    tracing::warn!(model = %model, error = %e, "model call failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.retry_backoff()) => {}
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                }
                Err(e) => return Err(AgentError::from_inference(&model, e)),
            }
        };

        tracing::info!(
            thread_id = %thread.id,
            text_len = generation.text.len(),
            tool_calls = generation.tool_calls.len(),
            tool_names = ?generation.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "model response"
        );

        if generation.tool_calls.is_empty() {
            checkpoint
                .state
                .messages
                .push(Message::assistant(generation.text, Vec::new()));
            checkpoint.phase = TurnPhase::Done;
            return self.save(checkpoint);
        }

        if checkpoint.round >= self.settings.max_round_trips {
            return Err(AgentError::TurnBudgetExceeded {
                max_round_trips: self.settings.max_round_trips,
            });
        }
        checkpoint.round += 1;
        checkpoint
            .state
            .messages
            .push(Message::assistant(generation.text, generation.tool_calls));
        checkpoint.phase = TurnPhase::Tools { next: 0 };
        self.save(checkpoint)
    }

    // ── TOOLS ──────────────────────────────────────────────────────────────

    async fn tools_step(
        &self,
        thread: &Thread,
        checkpoint: &mut Checkpoint,
        next: usize,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let calls = checkpoint.state.pending_calls();
        let Some(call) = calls.get(next) else {
            checkpoint.phase = TurnPhase::Assistant;
            return self.save(checkpoint);
        };

        let (model, generator) = self.bind_model(thread)?;
        let result = {
            let ctx = ToolContext {
                owner_id: thread.owner_id,
                model_name: &model,
                generator: &*generator,
                connections: &self.connections,
                state: &checkpoint.state,
                cancel,
                model_timeout: self.settings.model_timeout(),
                retry_backoff: self.settings.retry_backoff(),
            };
            self.router.dispatch(call, &ctx).await
        };

        let content = match result {
            Ok(outcome) => {
                if let Some(query_result) = outcome.query_result {
                    checkpoint.state.last_query_result = Some(query_result);
                }
                outcome.content
            }
            Err(e @ ToolError::Recoverable { .. }) => e.to_content(),
            Err(ToolError::Fatal(e)) => return Err(e),
        };

        checkpoint
            .state
            .messages
            .push(Message::tool(call, content.to_string()));
        checkpoint.phase = TurnPhase::Tools { next: next + 1 };
        self.save(checkpoint)?;
        let _ = events.send(TurnEvent::ToolResult(content)).await;
        Ok(())
    }
}

/// Stream one generation, forwarding text tokens as `Chunk` events.
async fn stream_generation(
    generator: &dyn Generator,
    messages: Vec<ChatMessage>,
    events: &mpsc::Sender<TurnEvent>,
    emitted: &mut bool,
    full_response: &mut String,
) -> Result<Generation, InferenceError> {
    let mut stream = generator
        .generate(messages, Some(ToolRouter::definitions()))
        .await?;
    let mut generation = Generation::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(token) = chunk.token.as_deref().filter(|t| !t.is_empty()) {
            *emitted = true;
            full_response.push_str(token);
            let _ = events.send(TurnEvent::Chunk(token.to_string())).await;
        }
        generation.absorb(chunk);
    }
    Ok(generation)
}
