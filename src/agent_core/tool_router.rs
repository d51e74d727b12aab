//! ToolRouter: dispatches model tool calls to the tool executors.
//!
//! Every executor returns `Result<ToolOutcome, ToolError>`. A
//! [`ToolError::Recoverable`] becomes a tool message the model can explain;
//! a [`ToolError::Fatal`] ends the turn.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::connections::{ConnectionError, ConnectionManager, QueryResult};
use crate::inference::generator::{complete, Generation, Generator};
use crate::inference::types::{ChatMessage, ToolCall, ToolDefinition};
use crate::inference::InferenceError;

use super::ask_analyst::{ask_analyst, AnalystSettings};
use super::ask_database::ask_database;
use super::errors::AgentError;
use super::types::AgentState;

pub const ASK_DATABASE: &str = "ask_database";
pub const ASK_ANALYST: &str = "ask_analyst";

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// A successful tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Payload streamed as `tool_result` and stored as the tool message.
    pub content: serde_json::Value,
    /// Set by `ask_database`; becomes `AgentState::last_query_result`.
    pub query_result: Option<QueryResult>,
}

/// A failed tool run.
#[derive(Debug)]
pub enum ToolError {
    /// Fed back to the model as a tool message; the turn continues.
    Recoverable { kind: &'static str, message: String },
    /// Ends the turn.
    Fatal(AgentError),
}

impl ToolError {
    pub fn recoverable(kind: &'static str, message: impl Into<String>) -> Self {
        ToolError::Recoverable {
            kind,
            message: message.into(),
        }
    }

    /// Tool-message payload for a recoverable error.
    pub fn to_content(&self) -> serde_json::Value {
        match self {
            ToolError::Recoverable { kind, message } => json!({
                "type": "error",
                "error_kind": kind,
                "message": message,
            }),
            ToolError::Fatal(e) => json!({
                "type": "error",
                "error_kind": e.kind(),
                "message": e.to_string(),
            }),
        }
    }
}

impl From<ConnectionError> for ToolError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::DecryptionFailed { .. }
            | ConnectionError::Storage { .. }
            | ConnectionError::Cancelled => ToolError::Fatal(e.into()),
            ConnectionError::UnsafeSqlRejected { reason } => {
                ToolError::recoverable("UnsafeSqlRejected", reason)
            }
            ConnectionError::QueryTimeout { .. } => ToolError::recoverable("QueryTimeout", e.to_string()),
            ConnectionError::QueryFailed { message } => ToolError::recoverable("QueryFailed", message),
            ConnectionError::NotFound { .. } => {
                ToolError::recoverable("ConnectionNotFound", e.to_string())
            }
            ConnectionError::ConnectionFailed { .. }
            | ConnectionError::UnsupportedDbType { .. }
            | ConnectionError::InvalidRecord { .. } => {
                ToolError::recoverable("ConnectionFailed", e.to_string())
            }
        }
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Everything an executor may use while it runs.
pub struct ToolContext<'a> {
    pub owner_id: i64,
    /// Canonical name of the turn's model, for error reporting.
    pub model_name: &'a str,
    pub generator: &'a dyn Generator,
    pub connections: &'a ConnectionManager,
    pub state: &'a AgentState,
    pub cancel: &'a CancellationToken,
    pub model_timeout: Duration,
    pub retry_backoff: Duration,
}

/// Run an internal model call for a tool, retrying once after a backoff.
///
/// A second failure is fatal: the turn cannot make progress without a model.
pub(crate) async fn tool_completion(
    ctx: &ToolContext<'_>,
    messages: Vec<ChatMessage>,
) -> Result<Generation, ToolError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let run = tokio::time::timeout(ctx.model_timeout, complete(ctx.generator, messages.clone()));
        let result = tokio::select! {
            r = run => r.unwrap_or_else(|_| Err(InferenceError::Timeout {
                duration_secs: ctx.model_timeout.as_secs(),
            })),
            _ = ctx.cancel.cancelled() => return Err(ToolError::Fatal(AgentError::Cancelled)),
        };

        match result {
            Ok(generation) => return Ok(generation),
            Err(e) if attempt < 2 => {
                tracing::warn!(model = ctx.model_name, error = %e, "tool model call failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.retry_backoff) => {}
                    _ = ctx.cancel.cancelled() => return Err(ToolError::Fatal(AgentError::Cancelled)),
                }
            }
            Err(e) => return Err(ToolError::Fatal(AgentError::from_inference(ctx.model_name, e))),
        }
    }
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Routes calls by name to `ask_database` and `ask_analyst`.
pub struct ToolRouter {
    analyst: AnalystSettings,
}

impl ToolRouter {
    pub fn new(analyst: AnalystSettings) -> Self {
        Self { analyst }
    }

    /// Tool definitions offered to the assistant step.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                ASK_DATABASE,
                "Consults the connected database. Describe the data you need in natural \
                 language; the tool writes and runs a read-only SQL query and returns the rows.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Natural-language description of the data to fetch"
                        },
                        "connection_id": {
                            "type": "integer",
                            "description": "Connection to query when several are selected: the \
                                connection_id shown in the schema header. Defaults to the \
                                connection whose tables the query reads."
                        }
                    },
                    "required": ["query"]
                }),
            ),
            ToolDefinition::function(
                ASK_ANALYST,
                "Asks the data analyst to build a chart from the most recent query result. \
                 Describe the chart you want.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The chart to build, e.g. 'bar chart of sales per month'"
                        }
                    },
                    "required": ["query"]
                }),
            ),
        ]
    }

    /// Run one tool call.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutcome, ToolError> {
        let start = Instant::now();
        let query = query_arg(call)?;

        let result = match call.name.as_str() {
            ASK_DATABASE => {
                let connection_id = call.arguments.get("connection_id").and_then(|v| v.as_i64());
                ask_database(ctx, &query, connection_id).await
            }
            ASK_ANALYST => ask_analyst(ctx, &self.analyst, &query).await,
            other => Err(ToolError::recoverable(
                "UnknownTool",
                format!("unknown tool '{other}'; available tools are {ASK_DATABASE} and {ASK_ANALYST}"),
            )),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(_) => tracing::info!(tool = %call.name, call_id = %call.id, elapsed_ms, "tool succeeded"),
            Err(ToolError::Recoverable { kind, ref message }) => tracing::warn!(
                tool = %call.name,
                call_id = %call.id,
                kind,
                message = %message,
                elapsed_ms,
                "tool failed, reporting to model"
            ),
            Err(ToolError::Fatal(ref e)) => tracing::error!(
                tool = %call.name,
                call_id = %call.id,
                error = %e,
                elapsed_ms,
                "tool failed fatally"
            ),
        }
        result
    }
}

/// The natural-language request of a call (`query`, or `natural_language_query`).
fn query_arg(call: &ToolCall) -> Result<String, ToolError> {
    call.arguments
        .get("query")
        .or_else(|| call.arguments.get("natural_language_query"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ToolError::recoverable(
                "InvalidArguments",
                format!("{} requires a non-empty string argument 'query'", call.name),
            )
        })
}
