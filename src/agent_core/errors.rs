//! Agent Core error types.
//!
//! [`AgentError`] is the orchestration taxonomy. Any variant that reaches the
//! state machine ends the turn and becomes the single `error` event of the
//! stream, rendered as `"<Kind>: <message>"`.

use thiserror::Error;

use crate::connections::ConnectionError;
use crate::inference::InferenceError;

/// Errors that end a turn or reject a control-surface call.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Neither the thread nor the configuration names a model.
    #[error("no model selected for this thread and no default model is configured")]
    NoModelSelected,

    /// The requested model name or alias is not registered.
    #[error("unknown model '{name}'")]
    UnknownModel { name: String },

    /// The model is not configured, or failed after a retry.
    #[error("model '{name}' is unavailable: {reason}")]
    ModelUnavailable { name: String, reason: String },

    /// The model kept requesting tools past the round-trip cap.
    #[error("turn exceeded {max_round_trips} model/tool round trips")]
    TurnBudgetExceeded { max_round_trips: u32 },

    /// A user database could not be reached.
    #[error("database connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// A stored connection secret could not be decrypted.
    #[error("could not decrypt connection secret: {reason}")]
    DecryptionFailed { reason: String },

    /// A query ran past its timeout.
    #[error("query timed out after {timeout_secs}s")]
    QueryTimeout { timeout_secs: u64 },

    /// A statement was not a single read-only query.
    #[error("unsafe SQL rejected: {reason}")]
    UnsafeSqlRejected { reason: String },

    /// No valid chart spec after the repair attempts.
    #[error("chart spec generation failed after {attempts} attempts: {reason}")]
    SpecGenerationFailed { attempts: u32, reason: String },

    /// Another turn is already running on this thread.
    #[error("thread '{thread_id}' is already processing a message")]
    ThreadBusy { thread_id: String },

    #[error("thread not found: '{thread_id}'")]
    ThreadNotFound { thread_id: String },

    #[error("connection {connection_id} not found")]
    ConnectionNotFound { connection_id: i64 },

    /// Thread or checkpoint storage failed.
    #[error("storage error: {reason}")]
    StorageError { reason: String },

    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// The client went away mid-turn.
    #[error("turn cancelled")]
    Cancelled,
}

impl AgentError {
    /// Taxonomy name used as the prefix of wire `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::NoModelSelected => "NoModelSelected",
            AgentError::UnknownModel { .. } => "UnknownModel",
            AgentError::ModelUnavailable { .. } => "ModelUnavailable",
            AgentError::TurnBudgetExceeded { .. } => "TurnBudgetExceeded",
            AgentError::ConnectionFailed { .. } => "ConnectionFailed",
            AgentError::DecryptionFailed { .. } => "DecryptionFailed",
            AgentError::QueryTimeout { .. } => "QueryTimeout",
            AgentError::UnsafeSqlRejected { .. } => "UnsafeSqlRejected",
            AgentError::SpecGenerationFailed { .. } => "SpecGenerationFailed",
            AgentError::ThreadBusy { .. } => "ThreadBusy",
            AgentError::ThreadNotFound { .. } => "ThreadNotFound",
            AgentError::ConnectionNotFound { .. } => "ConnectionNotFound",
            AgentError::StorageError { .. } => "StorageError",
            AgentError::SerializationError { .. } => "SerializationError",
            AgentError::Cancelled => "Cancelled",
        }
    }

    /// Human-readable message for the client.
    pub fn client_message(&self) -> String {
        format!("{}: {self}", self.kind())
    }

    /// Map a model failure for the named model.
    pub fn from_inference(model: &str, e: InferenceError) -> Self {
        match e {
            InferenceError::UnknownModel { name } => AgentError::UnknownModel { name },
            InferenceError::ModelUnavailable { name, reason } => {
                AgentError::ModelUnavailable { name, reason }
            }
            other => AgentError::ModelUnavailable {
                name: model.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<ConnectionError> for AgentError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::NotFound { connection_id, .. } => {
                AgentError::ConnectionNotFound { connection_id }
            }
            ConnectionError::DecryptionFailed { reason } => AgentError::DecryptionFailed { reason },
            ConnectionError::ConnectionFailed { target, reason } => AgentError::ConnectionFailed {
                reason: format!("{target}: {reason}"),
            },
            ConnectionError::QueryTimeout { timeout_secs } => AgentError::QueryTimeout { timeout_secs },
            ConnectionError::UnsafeSqlRejected { reason } => AgentError::UnsafeSqlRejected { reason },
            ConnectionError::Cancelled => AgentError::Cancelled,
            ConnectionError::Storage { reason } => AgentError::StorageError { reason },
            other @ (ConnectionError::QueryFailed { .. }
            | ConnectionError::UnsupportedDbType { .. }
            | ConnectionError::InvalidRecord { .. }) => AgentError::ConnectionFailed {
                reason: other.to_string(),
            },
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::StorageError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}
