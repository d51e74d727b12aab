//! `generateContent`-style provider.
//!
//! Vertex / Gemini speak `contents` + `parts` instead of chat messages and
//! return the whole answer in one response. The answer is replayed as a
//! single-chunk stream.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::client::{build_http_client, map_send_error, REQUEST_TIMEOUT};
use super::config::ModelConfig;
use super::errors::InferenceError;
use super::generator::{ChunkStream, Generator};
use super::streaming::parse_tool_call;
use super::types::{ChatMessage, Role, StreamChunk, ToolDefinition};

/// Client for a model behind a `generateContent` endpoint.
pub struct VertexClient {
    http: HttpClient,
    base_url: String,
    api_key: String,
    wire_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl VertexClient {
    pub fn new(key: &str, model: &ModelConfig) -> Result<Self, InferenceError> {
        let base_url = model
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| InferenceError::ConfigError {
                reason: format!("model '{key}' has no base_url"),
            })?;
        let api_key = model.api_key.clone().ok_or_else(|| InferenceError::ConfigError {
            reason: format!("model '{key}' has no api_key"),
        })?;

        Ok(Self {
            http: build_http_client(&base_url, REQUEST_TIMEOUT)?,
            base_url,
            api_key,
            wire_model: model.wire_name(key).to_string(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.wire_model)
    }
}

/// Translate chat messages into a `generateContent` request body.
pub(crate) fn build_request(
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    temperature: f32,
    max_tokens: u32,
) -> Value {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        let text = msg.content.clone().unwrap_or_default();
        match msg.role {
            Role::System => system.push(json!({ "text": text })),
            Role::User => contents.push(json!({ "role": "user", "parts": [{ "text": text }] })),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for call in msg.tool_calls.iter().flatten() {
                    let args: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                    parts.push(json!({
                        "functionCall": { "name": call.function.name, "args": args }
                    }));
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": "" }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Role::Tool => {
                let response: Value =
                    serde_json::from_str(&text).unwrap_or_else(|_| json!({ "content": text }));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": msg.name.clone().unwrap_or_default(),
                            "response": response,
                        }
                    }]
                }));
            }
        }
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": { "temperature": temperature, "maxOutputTokens": max_tokens },
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": system });
    }
    if let Some(tools) = tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Parse a `generateContent` response into a single chunk.
pub(crate) fn parse_response(body: &str) -> Result<StreamChunk, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        candidates: Vec<Candidate>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Candidate {
        content: Option<Content>,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct Content {
        #[serde(default)]
        parts: Vec<Part>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Part {
        text: Option<String>,
        function_call: Option<FunctionCall>,
    }

    #[derive(Deserialize)]
    struct FunctionCall {
        name: String,
        #[serde(default)]
        args: Value,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
        reason: format!("failed to parse generateContent response: {e}"),
    })?;
    let candidate = resp.candidates.into_iter().next().ok_or(InferenceError::StreamError {
        reason: "response has no candidates".into(),
    })?;

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let args = if fc.args.is_null() { json!({}) } else { fc.args };
            calls.push(parse_tool_call(None, &fc.name, &args.to_string())?);
        }
    }

    let finish_reason = if calls.is_empty() {
        candidate.finish_reason.map(|r| r.to_lowercase())
    } else {
        Some("tool_calls".into())
    };

    Ok(StreamChunk {
        token: (!text.is_empty()).then_some(text),
        tool_calls: (!calls.is_empty()).then_some(calls),
        finish_reason,
    })
}

#[async_trait]
impl Generator for VertexClient {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        let url = self.endpoint();
        let body = build_request(&messages, tools.as_deref(), self.temperature, self.max_tokens);

        tracing::info!(url = %url, message_count = messages.len(), "model request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, REQUEST_TIMEOUT))?;

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
