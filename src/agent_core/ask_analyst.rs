//! `ask_analyst`: last query result → Vega-Lite chart spec.
//!
//! The reply must parse as a JSON object. Invalid replies enter a repair loop
//! that shows the model its parse error; after the last attempt the tool fails
//! with `SpecGenerationFailed` and no spec leaves the tool.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::inference::types::ChatMessage;

use super::errors::AgentError;
use super::prompts;
use super::tool_router::{tool_completion, ToolContext, ToolError, ToolOutcome};

/// `analyst:` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystSettings {
    /// Model attempts per chart, including repairs.
    pub max_attempts: u32,
    /// Rows of the last result sent to the model and attached to the spec.
    pub data_rows: usize,
}

impl Default for AnalystSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            data_rows: 200,
        }
    }
}

/// Parse a reply into a JSON object, tolerating fences and surrounding prose.
pub fn parse_spec(reply: &str) -> Result<Value, String> {
    let trimmed = reply.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("expected a JSON object".into()),
        Err(e) => Err(e.to_string()),
    }
}

/// Inline `records` as `data.values` unless the spec already names its data.
pub fn attach_data(spec: &mut Value, records: Vec<Value>) {
    let has_data = spec
        .get("data")
        .map(|d| d.get("values").is_some() || d.get("url").is_some() || d.get("name").is_some())
        .unwrap_or(false);
    if !has_data {
        if let Value::Object(ref mut map) = spec {
            map.insert("data".into(), json!({ "values": records }));
        }
    }
}

pub async fn ask_analyst(
    ctx: &ToolContext<'_>,
    settings: &AnalystSettings,
    query: &str,
) -> Result<ToolOutcome, ToolError> {
    let result = ctx.state.last_query_result.as_ref().ok_or_else(|| {
        ToolError::recoverable(
            "NoQueryResult",
            "There is no query result to chart yet. Call ask_database first.",
        )
    })?;

    let records = result.records(settings.data_rows);
    let mut messages: Vec<ChatMessage> =
        prompts::chart_generation(&result.columns, &Value::Array(records.clone()), query);

    let attempts = settings.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let generation = tool_completion(ctx, messages.clone()).await?;
        match parse_spec(&generation.text) {
            Ok(mut spec) => {
                tracing::info!(attempt, "chart spec generated");
                attach_data(&mut spec, records);
                return Ok(ToolOutcome {
                    content: json!({ "type": "chart_spec", "spec": spec.to_string() }),
                    query_result: None,
                });
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "chart spec was not valid JSON");
                messages.push(ChatMessage::assistant(generation.text));
                messages.push(prompts::chart_repair(&e));
                last_error = e;
            }
        }
    }

    let failure = AgentError::SpecGenerationFailed {
        attempts,
        reason: last_error,
    };
    Err(ToolError::recoverable(failure.kind(), failure.to_string()))
}
