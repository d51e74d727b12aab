//! Agent Core: the conversational orchestration layer.
//!
//! Submodules:
//! - `state_machine`: ASSISTANT / TOOLS / DONE / FAILED turn driver
//! - `tool_router`: dispatches model tool calls to the executors
//! - `ask_database`, `ask_analyst`: the two tool executors
//! - `prompts`: system, SQL-generation and chart prompts
//! - `store`, `database`: thread and checkpoint storage (memory / SQLite)
//! - `leases`: one turn per thread at a time
//! - `types`: shared types across the agent core
//! - `errors`: agent-level error taxonomy

pub mod ask_analyst;
pub mod ask_database;
pub mod database;
pub mod errors;
pub mod leases;
pub mod prompts;
pub mod state_machine;
pub mod store;
pub mod tool_router;
pub mod types;

pub use ask_analyst::AnalystSettings;
pub use database::SqliteStore;
pub use errors::AgentError;
pub use leases::{ThreadLease, ThreadLeases};
pub use state_machine::{AgentSettings, AgentStateMachine};
pub use store::{CheckpointStore, MemoryStore, ThreadStore};
pub use tool_router::{ToolError, ToolOutcome, ToolRouter};
pub use types::{AgentState, Checkpoint, Message, Thread, TurnEvent, TurnPhase};
