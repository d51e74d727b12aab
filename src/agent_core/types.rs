//! Shared types for the agent core.
//!
//! Threads, the message log, the per-turn working state and its checkpoint,
//! and the events the state machine emits while a turn runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::QueryResult;
use crate::inference::types::{ChatMessage, Role, ToolCall};

// ─── Threads ────────────────────────────────────────────────────────────────

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub owner_id: i64,
    /// Model chosen for this thread; the registry default applies when unset.
    pub model_name: Option<String>,
    /// Selected connections, in selection order.
    pub connection_ref: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(owner_id: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            model_name: None,
            connection_ref: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// One entry of a thread's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    /// Calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `tool` messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `tool` messages: the tool that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    /// Assistant reply. Empty `calls` means a plain text answer.
    pub fn assistant(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        Self {
            role: Role::Assistant,
            content: if text.is_empty() && !calls.is_empty() {
                None
            } else {
                Some(text)
            },
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tool(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            timestamp: Utc::now(),
        }
    }

    /// Wire shape for the model, with tool content clipped to `max_tool_bytes`.
    pub fn to_chat_message(&self, max_tool_bytes: usize) -> ChatMessage {
        let content = match (self.role, self.content.as_deref()) {
            (Role::Tool, Some(text)) => Some(super::prompts::clip(text, max_tool_bytes)),
            (_, content) => content.map(str::to_string),
        };
        ChatMessage {
            role: self.role,
            content,
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
            tool_calls: self
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().map(ToolCall::to_response).collect()),
        }
    }
}

// ─── Agent State ────────────────────────────────────────────────────────────

/// Working state of a thread, checkpointed after every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    pub model_name: Option<String>,
    /// Markdown rendering of the connected databases. Refreshed only when the
    /// connection changes.
    pub db_schema_snapshot: Option<String>,
    pub connection_ref: Vec<i64>,
    pub last_query_result: Option<QueryResult>,
}

impl AgentState {
    /// Calls of the most recent assistant message that requested tools.
    pub fn pending_calls(&self) -> Vec<ToolCall> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.tool_calls.clone())
            .unwrap_or_default()
    }

    /// Answer any tool call of the last assistant message that has no result
    /// yet, so the log stays well-formed after an interrupted turn.
    pub fn close_dangling_calls(&mut self) -> usize {
        let Some(pos) = self.messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return 0;
        };
        let calls = self.messages[pos].tool_calls.clone().unwrap_or_default();
        let answered: Vec<String> = self.messages[pos + 1..]
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();

        let mut closed = 0;
        for call in calls.iter().filter(|c| !answered.contains(&c.id)) {
            let content = serde_json::json!({
                "type": "error",
                "error_kind": "Interrupted",
                "message": "The previous turn ended before this tool ran.",
            });
            self.messages.push(Message::tool(call, content.to_string()));
            closed += 1;
        }
        closed
    }
}

/// Where a turn stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TurnPhase {
    /// No turn has run yet.
    Idle,
    Assistant,
    /// Running the pending calls; `next` is the index of the first call
    /// without a result.
    Tools { next: usize },
    Done,
    Failed { error: String },
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnPhase::Idle | TurnPhase::Done | TurnPhase::Failed { .. })
    }
}

/// Persisted state of a thread between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub state: AgentState,
    pub phase: TurnPhase,
    /// ASSISTANT→TOOLS transitions taken in the current turn.
    pub round: u32,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            state: AgentState::default(),
            phase: TurnPhase::Idle,
            round: 0,
            updated_at: Utc::now(),
        }
    }
}

// ─── Turn Events ────────────────────────────────────────────────────────────

/// Events the state machine produces while a turn runs, in order.
#[derive(Debug)]
pub enum TurnEvent {
    /// A streamed piece of assistant text.
    Chunk(String),
    /// A tool finished (successfully or with a recoverable error).
    ToolResult(serde_json::Value),
    /// The turn reached DONE.
    End { full_response: String },
    /// The turn reached FAILED.
    Error(super::errors::AgentError),
}
