//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to an OpenAI-compatible endpoint (LM Studio,
//! DeepSeek, vLLM) and streams back tokens and tool calls.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::generator::{ChunkStream, Generator};
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ChatMessage, StreamChunk, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Local models can take a long time to emit the first token when the
/// schema snapshot makes the prompt large.
pub(crate) const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── OpenAiClient ────────────────────────────────────────────────────────────

/// Client for one model behind an OpenAI-compatible endpoint.
pub struct OpenAiClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests.
    http_stream: HttpClient,
    base_url: String,
    api_key: Option<String>,
    /// Identifier sent as `model` in the request body.
    wire_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    /// Create a client for the model registered under `key`.
    ///
    /// Does NOT check connectivity. That happens on the first request.
    pub fn new(key: &str, model: &ModelConfig) -> Result<Self, InferenceError> {
        let base_url = model
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| InferenceError::ConfigError {
                reason: format!("model '{key}' has no base_url"),
            })?;

        let http = build_http_client(&base_url, REQUEST_TIMEOUT)?;
        let http_stream = build_http_client(&base_url, STREAM_REQUEST_TIMEOUT)?;

        Ok(Self {
            http,
            http_stream,
            api_key: model.api_key.clone().filter(|k| !k.trim().is_empty()),
            wire_model: model.wire_name(key).to_string(),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            base_url,
        })
    }

    /// The base URL of this model's endpoint.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.wire_model.clone(),
            messages,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.temperature,
            top_p: None,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    fn post(&self, http: &HttpClient, url: &str) -> reqwest::RequestBuilder {
        let builder = http.post(url);
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    // ─── Chat Completion (streaming) ─────────────────────────────────────

    /// Send a streaming chat completion request.
    async fn try_stream_request(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, tools, true);

        // Request metadata only; the body carries the schema and can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "model request"
        );

        let response = self
            .post(&self.http_stream, &url)
            .json(&body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, STREAM_REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response).boxed())
    }

    // ─── Chat Completion (non-streaming) ─────────────────────────────────

    /// Send a non-streaming chat completion request.
    ///
    /// Returns a single `StreamChunk` with the complete response.
    pub async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<StreamChunk, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, tools, false);

        let response = self
            .post(&self.http, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_non_streaming_response(&body_text)
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check if the endpoint is reachable.
    ///
    /// Hits `GET {base_url}/models`, which does not consume inference tokens.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut request = self.http.get(&url).timeout(CONNECT_TIMEOUT);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Generator for OpenAiClient {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChunkStream, InferenceError> {
        self.try_stream_request(messages, tools).await
    }
}

pub(crate) fn build_http_client(
    endpoint: &str,
    timeout: Duration,
) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| InferenceError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

pub(crate) fn map_send_error(url: &str, e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::Provider;
    use crate::inference::generator::Generation;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model_at(base_url: &str, api_key: Option<&str>) -> ModelConfig {
        ModelConfig {
            provider: Provider::OpenaiCompatible,
            model_name: Some("qwen/qwen3-8b".into()),
            base_url: Some(base_url.to_string()),
            api_key: api_key.map(String::from),
            api_key_required: false,
            aliases: vec![],
            temperature: 0.0,
            max_tokens: 512,
            enabled: true,
        }
    }

    #[test]
    fn test_new_requires_base_url() {
        let mut model = model_at("http://localhost:1234/v1", None);
        model.base_url = None;
        assert!(OpenAiClient::new("qwen3-8b", &model).is_err());
    }

    #[test]
    fn test_request_body_uses_wire_name_and_auto_tool_choice() {
        let client = OpenAiClient::new("qwen3-8b", &model_at("http://localhost:1234/v1/", None))
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:1234/v1");
        let tools = vec![ToolDefinition::function(
            "ask_database",
            "query",
            serde_json::json!({"type": "object"}),
        )];
        let body = client.request_body(vec![ChatMessage::user("hi")], Some(tools), true);
        assert_eq!(body.model, "qwen/qwen3-8b");
        assert_eq!(body.tool_choice.as_deref(), Some("auto"));
        assert!(body.stream);
    }

    #[tokio::test]
    async fn test_generate_streams_tokens_over_sse() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"There are \"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"3 sales.\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let client = OpenAiClient::new("deepseek-chat", &model_at(&base, Some("sk-test"))).unwrap();
        let mut stream = client
            .generate(vec![ChatMessage::user("how many sales?")], None)
            .await
            .unwrap();

        let mut tokens = Vec::new();
        let mut generation = Generation::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(ref t) = chunk.token {
                tokens.push(t.clone());
            }
            generation.absorb(chunk);
        }
        assert_eq!(tokens, vec!["There are ", "3 sales."]);
        assert_eq!(generation.text, "There are 3 sales.");
    }

    #[tokio::test]
    async fn test_generate_streams_tool_calls() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"ask_database\",\"arguments\":\"{\\\"query\\\":\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"leads\\\"}\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client =
            OpenAiClient::new("qwen3-8b", &model_at(&format!("{}/v1", server.uri()), None))
                .unwrap();
        let mut stream = client.generate(vec![], None).await.unwrap();
        let mut generation = Generation::default();
        while let Some(chunk) = stream.next().await {
            generation.absorb(chunk.unwrap());
        }
        assert_eq!(generation.tool_calls.len(), 1);
        assert_eq!(generation.tool_calls[0].id, "call_9");
        assert_eq!(generation.tool_calls[0].arguments["query"], "leads");
    }

    #[tokio::test]
    async fn test_generate_maps_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let client =
            OpenAiClient::new("qwen3-8b", &model_at(&format!("{}/v1", server.uri()), None))
                .unwrap();
        let err = client.generate(vec![], None).await.err().unwrap();
        match err {
            InferenceError::HttpError { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model not loaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_completion_non_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"choices":[{"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}]}"#,
            ))
            .mount(&server)
            .await;

        let client =
            OpenAiClient::new("qwen3-8b", &model_at(&format!("{}/v1", server.uri()), None))
                .unwrap();
        let chunk = client.chat_completion(vec![], None).await.unwrap();
        assert_eq!(chunk.token.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_health_check_unreachable_is_false() {
        let client = OpenAiClient::new("qwen3-8b", &model_at("http://127.0.0.1:9/v1", None)).unwrap();
        assert!(!client.health_check().await);
    }
}
