//! Model access for the agent.
//!
//! - the [`Generator`] capability every provider implements
//! - OpenAI-compatible streaming client (LM Studio, DeepSeek)
//! - `generateContent`-style and custom JSON providers
//! - the [`ModelRegistry`] that maps names and aliases to generators
//!
//! Switching the model behind a thread is a registry lookup, not a code change.

pub mod client;
pub mod config;
pub mod custom;
pub mod errors;
pub mod generator;
pub mod registry;
pub mod scripted;
pub mod streaming;
pub mod types;
pub mod vertex;

pub use client::OpenAiClient;
pub use config::{ModelConfig, ModelsConfig, Provider};
pub use errors::InferenceError;
pub use generator::{complete, ChunkStream, Generation, Generator};
pub use registry::{ModelDescriptor, ModelRegistry};
pub use scripted::{ScriptStep, ScriptedGenerator};
pub use types::{ChatMessage, Role, StreamChunk, ToolCall, ToolDefinition};
