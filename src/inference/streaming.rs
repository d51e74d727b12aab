//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads a `reqwest::Response` as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and accumulates tool calls
//! across multiple deltas.

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, StreamChunk, ToolCall};

// ─── SSE line parser ─────────────────────────────────────────────────────────

/// Parse raw SSE bytes into `StreamChunk`s.
///
/// 1. Splits the HTTP body into SSE events
/// 2. Parses each `data:` line as a `ChatCompletionChunk`
/// 3. Accumulates tool call fragments across deltas
/// 4. Emits a `StreamChunk` for each event that carries something
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>> {
    let byte_stream = response.bytes_stream();
    let state = StreamState::default();

    stream::unfold(
        (byte_stream, state, String::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                if let Some(event_end) = buffer.find("\n\n") {
                    let event = buffer[..event_end].to_string();
                    buffer = buffer[event_end + 2..].to_string();

                    match state.process_event(&event) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (byte_stream, state, buffer))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, state, buffer))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        // Normalise CRLF framing so the boundary search stays simple.
                        let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                        buffer.push_str(&text);
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer),
                        ));
                    }
                    None => {
                        if !buffer.trim().is_empty() {
                            let rest = std::mem::take(&mut buffer);
                            match state.process_event(rest.trim()) {
                                Ok(Some(chunk)) => {
                                    return Some((Ok(chunk), (byte_stream, state, buffer)))
                                }
                                Ok(None) => {}
                                Err(e) => return Some((Err(e), (byte_stream, state, buffer))),
                            }
                        }
                        // Server closed without [DONE]: flush whatever tool calls are pending.
                        return match state.finalize() {
                            Ok(Some(chunk)) => Some((Ok(chunk), (byte_stream, state, buffer))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (byte_stream, state, buffer))),
                        };
                    }
                }
            }
        },
    )
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// Mutable state for accumulating tool call fragments across SSE events.
#[derive(Default)]
struct StreamState {
    /// In-progress tool calls: `(index, id, name, arguments_buffer)`.
    pending_tool_calls: Vec<(u32, Option<String>, String, String)>,
}

impl StreamState {
    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<Option<StreamChunk>, InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return self.finalize();
                }
                data_content.push_str(data);
            }
        }

        if data_content.is_empty() {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        self.process_chunk(chunk)
    }

    fn process_chunk(
        &mut self,
        chunk: ChatCompletionChunk,
    ) -> Result<Option<StreamChunk>, InferenceError> {
        let choice = match chunk.choices.first() {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut result = StreamChunk {
            token: None,
            tool_calls: None,
            finish_reason: choice.finish_reason.clone(),
        };

        // Only `content` reaches the user; `reasoning` is dropped.
        if let Some(ref content) = choice.delta.content {
            if !content.is_empty() {
                result.token = Some(content.clone());
            }
        }

        if let Some(ref tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let pending = self
                    .pending_tool_calls
                    .iter_mut()
                    .find(|(idx, _, _, _)| *idx == index);

                match pending {
                    Some((_, ref mut id, ref mut name, ref mut args)) => {
                        if let Some(ref f) = tc.function {
                            if let Some(ref n) = f.name {
                                name.push_str(n);
                            }
                            if let Some(ref a) = f.arguments {
                                args.push_str(a);
                            }
                        }
                        if tc.id.is_some() {
                            *id = tc.id.clone();
                        }
                    }
                    None => {
                        let name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        let args = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.arguments.clone())
                            .unwrap_or_default();
                        self.pending_tool_calls
                            .push((index, tc.id.clone(), name, args));
                    }
                }
            }
        }

        if result.finish_reason.is_some() && !self.pending_tool_calls.is_empty() {
            result.tool_calls = Some(self.finalize_tool_calls()?);
            result.finish_reason = Some("tool_calls".into());
        }

        if result.token.is_none() && result.tool_calls.is_none() && result.finish_reason.is_none() {
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn finalize_tool_calls(&mut self) -> Result<Vec<ToolCall>, InferenceError> {
        let mut pending = std::mem::take(&mut self.pending_tool_calls);
        pending.sort_by_key(|(index, _, _, _)| *index);

        pending
            .into_iter()
            .map(|(_, id, name, args)| parse_tool_call(id.as_deref(), &name, &args))
            .collect()
    }

    fn finalize(&mut self) -> Result<Option<StreamChunk>, InferenceError> {
        if self.pending_tool_calls.is_empty() {
            return Ok(None);
        }
        let calls = self.finalize_tool_calls()?;
        Ok(Some(StreamChunk {
            token: None,
            tool_calls: Some(calls),
            finish_reason: Some("tool_calls".into()),
        }))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Build a [`ToolCall`] from a native JSON tool call (name + arguments string).
///
/// Empty argument strings are accepted as `{}`; some servers omit arguments
/// for parameterless calls.
pub fn parse_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    let call_id = id
        .filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(arguments_json).map_err(|e| InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: format!("invalid JSON arguments: {e}"),
        })?
    };

    Ok(ToolCall {
        id: call_id,
        name: name.to_string(),
        arguments,
    })
}

/// Parse a non-streaming Chat Completions body into a single chunk.
pub fn parse_non_streaming_response(body: &str) -> Result<StreamChunk, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
        tool_calls: Option<Vec<NonStreamToolCall>>,
    }

    #[derive(Deserialize)]
    struct NonStreamToolCall {
        id: Option<String>,
        function: NonStreamFunction,
    }

    #[derive(Deserialize)]
    struct NonStreamFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp.choices.first().ok_or(InferenceError::StreamError {
        reason: "empty choices array".into(),
    })?;

    let content = choice.message.content.clone().filter(|c| !c.is_empty());

    let tool_calls = choice
        .message
        .tool_calls
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tc| parse_tool_call(tc.id.as_deref(), &tc.function.name, &tc.function.arguments))
        .collect::<Result<Vec<_>, _>>()?;

    let finish_reason = if tool_calls.is_empty() {
        choice.finish_reason.clone()
    } else {
        Some("tool_calls".into())
    };

    Ok(StreamChunk {
        token: content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        finish_reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
