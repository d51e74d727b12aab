//! Custom JSON endpoint provider.
//!
//! Posts `{model, messages, tools}` and expects
//! `{"text": "...", "tool_calls": [{"id", "name", "arguments"}]}` back.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use super::client::{build_http_client, map_send_error, REQUEST_TIMEOUT};
use super::config::ModelConfig;
use super::errors::InferenceError;
use super::generator::{ChunkStream, Generator};
use super::streaming::parse_tool_call;
use super::types::{ChatMessage, StreamChunk, ToolDefinition};

#[derive(Serialize)]
struct CustomRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CustomResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CustomToolCall>,
}

#[derive(Deserialize)]
struct CustomToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

pub struct CustomClient {
    http: HttpClient,
    url: String,
    api_key: Option<String>,
    wire_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl CustomClient {
    pub fn new(key: &str, model: &ModelConfig) -> Result<Self, InferenceError> {
        let url = model.base_url.clone().ok_or_else(|| InferenceError::ConfigError {
            reason: format!("model '{key}' has no base_url"),
        })?;
        Ok(Self {
            http: build_http_client(&url, REQUEST_TIMEOUT)?,
            url,
            api_key: model.api_key.clone().filter(|k| !k.trim().is_empty()),
            wire_model: model.wire_name(key).to_string(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        })
    }
}

fn parse_response(body: &str) -> Result<StreamChunk, InferenceError> {
    let resp: CustomResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse custom endpoint response: {e}"),
        })?;

    // Arguments may arrive as an object or as a JSON-encoded string.
    let calls = resp
        .tool_calls
        .into_iter()
        .map(|tc| {
            let raw = match tc.arguments {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            parse_tool_call(tc.id.as_deref(), &tc.name, &raw)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let finish_reason = if calls.is_empty() { "stop" } else { "tool_calls" };
    Ok(StreamChunk {
        token: resp.text.filter(|t| !t.is_empty()),
        tool_calls: (!calls.is_empty()).then_some(calls),
        finish_reason: Some(finish_reason.into()),
    })
}

#[async_trait]
impl Generator for CustomClient {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        let body = CustomRequest {
            model: &self.wire_model,
            messages: &messages,
            tools: tools.as_deref(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(&self.url, e, REQUEST_TIMEOUT))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: text,
            });
        }

        let chunk = parse_response(&text)?;
        Ok(stream::once(async move { Ok(chunk) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_response() {
        let chunk = parse_response(r#"{"text": "42 leads"}"#).unwrap();
        assert_eq!(chunk.token.as_deref(), Some("42 leads"));
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_tool_calls_with_string_or_object_arguments() {
        let body = r#"{
            "tool_calls": [
                {"id": "a", "name": "ask_database", "arguments": "{\"query\": \"x\"}"},
                {"name": "ask_analyst", "arguments": {"query": "bar chart"}}
            ]
        }"#;
        let chunk = parse_response(body).unwrap();
        let calls = chunk.tool_calls.unwrap();
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].arguments["query"], "x");
        assert_eq!(calls[1].arguments["query"], "bar chart");
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
    }
}
