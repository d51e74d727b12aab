//! Streaming Adapter.
//!
//! Turns the state machine's [`TurnEvent`]s into the wire protocol: one JSON
//! object per event, framed as SSE (`data: ...\n\n`) or newline-delimited JSON.
//! At most one terminal event (`end` or `error`) is yielded and it is always
//! last. Dropping a [`TurnStream`] cancels the turn behind it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::agent_core::{AgentError, TurnEvent};

/// One wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { content: String },
    ToolResult { content: serde_json::Value },
    End { full_response: String },
    Error { error: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }

    pub fn from_error(error: &AgentError) -> Self {
        StreamEvent::Error {
            error: error.client_message(),
        }
    }

    /// Newline-delimited JSON line, newline included.
    pub fn to_json_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"SerializationError: {e}"}}"#)
        });
        line.push('\n');
        line
    }

    /// Server-sent events frame.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n", self.to_json_line())
    }
}

impl From<TurnEvent> for StreamEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Chunk(content) => StreamEvent::Chunk { content },
            TurnEvent::ToolResult(content) => StreamEvent::ToolResult { content },
            TurnEvent::End { full_response } => StreamEvent::End { full_response },
            TurnEvent::Error(e) => StreamEvent::from_error(&e),
        }
    }
}

/// Wire framing selected by the client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Sse,
    Ndjson,
}

impl WireFormat {
    pub fn frame(&self, event: &StreamEvent) -> String {
        match self {
            WireFormat::Sse => event.to_sse_frame(),
            WireFormat::Ndjson => event.to_json_line(),
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sse" => Ok(WireFormat::Sse),
            "ndjson" | "jsonl" => Ok(WireFormat::Ndjson),
            other => Err(format!("unknown wire format '{other}' (expected sse or ndjson)")),
        }
    }
}

// ─── TurnStream ─────────────────────────────────────────────────────────────

enum Source {
    Live(mpsc::Receiver<TurnEvent>),
    Rejected(Option<AgentError>),
}

/// Ordered wire events of one turn.
pub struct TurnStream {
    source: Source,
    finished: bool,
    _cancel_on_drop: Option<DropGuard>,
}

impl TurnStream {
    /// Stream events from a running turn; dropping the stream cancels it.
    pub fn live(rx: mpsc::Receiver<TurnEvent>, cancel: CancellationToken) -> Self {
        Self {
            source: Source::Live(rx),
            finished: false,
            _cancel_on_drop: Some(cancel.drop_guard()),
        }
    }

    /// A turn that never started: a single `error` event.
    pub fn rejected(error: AgentError) -> Self {
        Self {
            source: Source::Rejected(Some(error)),
            finished: false,
            _cancel_on_drop: None,
        }
    }
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let event = match this.source {
            Source::Rejected(ref mut error) => match error.take() {
                Some(e) => StreamEvent::from_error(&e),
                None => StreamEvent::Error {
                    error: "Cancelled: turn already reported".into(),
                },
            },
            Source::Live(ref mut rx) => match rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(event)) => StreamEvent::from(event),
                Poll::Ready(None) => {
                    tracing::warn!("turn task ended without a terminal event");
                    StreamEvent::Error {
                        error: "Cancelled: turn ended unexpectedly".into(),
                    }
                }
            },
        };

        if event.is_terminal() {
            this.finished = true;
        }
        Poll::Ready(Some(event))
    }
}
