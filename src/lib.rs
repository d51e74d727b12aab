//! Aigis: a conversational agent that answers questions over user databases.
//!
//! - `inference`: the `Generator` capability, provider clients, Model Registry
//! - `connections`: Connection Manager (encrypted records, pools, introspection,
//!   guarded execution)
//! - `agent_core`: the turn state machine and the `ask_database` /
//!   `ask_analyst` tools
//! - `streaming`: the `chunk` / `tool_result` / `end` / `error` wire protocol
//! - `engine`: the control surface transports call into

pub mod agent_core;
pub mod config;
pub mod connections;
pub mod engine;
pub mod inference;
pub mod logging;
pub mod streaming;

pub use config::AppConfig;
pub use engine::{Engine, ModelSelection};
pub use streaming::{StreamEvent, TurnStream, WireFormat};
