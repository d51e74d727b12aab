//! Prompt construction for the assistant step and the two tool executors.

use crate::connections::QueryResult;
use crate::inference::types::ChatMessage;

/// Rows of the last query result shown to the assistant step.
const LAST_RESULT_PREVIEW_ROWS: usize = 20;

const PERSONA: &str = "\
# Persona
You are a helpful and knowledgeable data assistant. Your goal is to answer \
questions about the user's data accurately and efficiently using your tools. \
Be professional, clear and concise.

# Core Instructions
Answer by following a two-step process:

1. Query the database: use the `ask_database` tool to retrieve the data.
2. Visualize the data: if the user asks for a chart, use the `ask_analyst` \
tool on the data returned by `ask_database`.

Never call `ask_analyst` before you have data from `ask_database`. For a \
follow-up chart of data you already retrieved, call `ask_analyst` directly.

# Tools
- ask_database(query): a natural-language description of the data to fetch. \
Returns the generated SQL and the rows.
- ask_analyst(query): a natural-language description of the chart to build \
from the last query result. Returns a Vega-Lite chart spec.

# Guidelines
- If the request is ambiguous, ask a clarifying question before calling tools.
- If a tool returns an error, explain the problem plainly. Do not paste raw \
error payloads.
- Only use the tools provided.
- Be concise.";

/// Truncate a string to at most `max_bytes` bytes on a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate with a marker saying how much was cut.
pub(crate) fn clip(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let kept = truncate_utf8(s, max_bytes);
    format!("{kept}\n[truncated {} bytes]", s.len() - kept.len())
}

/// Compact JSON preview of a query result.
pub fn result_preview(result: &QueryResult, rows: usize) -> String {
    serde_json::json!({
        "columns": result.columns,
        "rows": result.rows.iter().take(rows).collect::<Vec<_>>(),
        "row_count": result.row_count(),
        "truncated": result.truncated,
    })
    .to_string()
}

/// System prompt for the assistant step.
pub fn system_prompt(schema: Option<&str>, last_result: Option<&QueryResult>) -> String {
    let mut prompt = String::from(PERSONA);

    prompt.push_str("\n\nHere is the database schema with sample rows:\n<db_schema>\n");
    match schema {
        Some(s) if !s.trim().is_empty() => prompt.push_str(s.trim_end()),
        _ => prompt.push_str("No database is connected to this conversation."),
    }
    prompt.push_str("\n</db_schema>");

    if let Some(result) = last_result {
        prompt.push_str("\n\nMost recent query result:\n<last_query_result>\n");
        prompt.push_str(&result_preview(result, LAST_RESULT_PREVIEW_ROWS));
        prompt.push_str("\n</last_query_result>");
    }
    prompt
}

/// Messages asking the model for one read-only SQL statement.
pub fn sql_generation(schema: &str, question: &str) -> Vec<ChatMessage> {
    let system = format!(
        "You translate questions into SQL.\n\
         Reply with exactly one read-only SELECT statement and nothing else: \
         no explanation, no markdown. Never modify data. Only use tables and \
         columns that appear in the schema. When several connections are \
         listed, query the tables of a single connection; the statement runs \
         on the connection that lists those tables.\n\n\
         <db_schema>\n{}\n</db_schema>",
        schema.trim_end()
    );
    vec![ChatMessage::system(system), ChatMessage::user(question)]
}

/// Messages asking the model for a chart spec over `data`.
pub fn chart_generation(columns: &[String], data: &serde_json::Value, request: &str) -> Vec<ChatMessage> {
    let system = "You are a data visualization expert.\n\
         Reply with a single Vega-Lite JSON object and nothing else: no \
         explanation, no markdown. Encode fields by the exact column names \
         given. You may omit `data`; the rows are attached for you.";
    let user = format!(
        "Request: {request}\n\nColumns: {}\n\nData (JSON records):\n{data}",
        columns.join(", ")
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Follow-up message after a reply that was not valid JSON.
pub fn chart_repair(error: &str) -> ChatMessage {
    ChatMessage::user(format!(
        "That reply was not a valid JSON object ({error}). \
         Reply again with only the corrected Vega-Lite JSON object."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let s = "héllo";
        assert_eq!(truncate_utf8(s, 2), "h");
        assert_eq!(truncate_utf8(s, 3), "hé");
        assert_eq!(truncate_utf8(s, 100), s);
    }

    #[test]
    fn test_clip_reports_cut() {
        assert_eq!(clip("abcdef", 10), "abcdef");
        assert_eq!(clip("abcdef", 4), "abcd\n[truncated 2 bytes]");
    }

    #[test]
    fn test_system_prompt_sections() {
        let result = QueryResult {
            columns: vec!["n".into()],
            rows: vec![vec![json!(2)]],
            truncated: false,
        };
        let prompt = system_prompt(Some("### sales\n"), Some(&result));
        assert!(prompt.contains("<db_schema>\n### sales\n</db_schema>"));
        assert!(prompt.contains("<last_query_result>"));
        assert!(prompt.contains(r#""row_count":1"#));

        let bare = system_prompt(None, None);
        assert!(bare.contains("No database is connected"));
        assert!(!bare.contains("<last_query_result>"));
    }

    #[test]
    fn test_sql_prompt_carries_schema_and_question() {
        let messages = sql_generation("### leads\n", "how many leads?");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.as_deref().unwrap().contains("### leads"));
        assert_eq!(messages[1].content.as_deref(), Some("how many leads?"));
    }
}
