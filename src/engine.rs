//! The control surface consumed by transports and the CLI.
//!
//! `Engine` owns the registry, the Connection Manager, the stores and the
//! per-thread leases. Each `send_message` takes the thread's lease, records
//! the user message, and spawns the turn as an independent task whose events
//! are returned as a [`TurnStream`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent_core::{
    AgentError, AgentSettings, AgentStateMachine, AnalystSettings, Checkpoint, CheckpointStore,
    Message, Thread, ThreadLease, ThreadLeases, ThreadStore, ToolRouter, TurnPhase,
};
use crate::connections::{ConnectionError, ConnectionManager};
use crate::inference::ModelRegistry;
use crate::streaming::TurnStream;

/// Response of [`Engine::get_model`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSelection {
    /// The model the next turn will use, if any.
    pub current: Option<String>,
    /// Canonical name → available.
    pub models: BTreeMap<String, bool>,
}

pub struct Engine {
    registry: Arc<ModelRegistry>,
    connections: Arc<ConnectionManager>,
    threads: Arc<dyn ThreadStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    leases: ThreadLeases,
    machine: AgentStateMachine,
}

impl Engine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        connections: Arc<ConnectionManager>,
        threads: Arc<dyn ThreadStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        agent: AgentSettings,
        analyst: AnalystSettings,
    ) -> Self {
        let machine = AgentStateMachine::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&checkpoints),
            Arc::new(ToolRouter::new(analyst)),
            agent,
        );
        Self {
            registry,
            connections,
            threads,
            checkpoints,
            leases: ThreadLeases::new(),
            machine,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    // ─── Threads ────────────────────────────────────────────────────────────

    pub fn create_thread(&self, owner_id: i64) -> Result<String, AgentError> {
        let thread = Thread::new(owner_id);
        self.threads.create_thread(&thread)?;
        self.checkpoints.save_checkpoint(&Checkpoint::new(&thread.id))?;
        tracing::info!(thread_id = %thread.id, owner_id, "thread created");
        Ok(thread.id)
    }

    fn thread(&self, thread_id: &str) -> Result<Thread, AgentError> {
        self.threads
            .get_thread(thread_id)?
            .ok_or_else(|| AgentError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })
    }

    fn checkpoint(&self, thread_id: &str) -> Result<Checkpoint, AgentError> {
        Ok(self
            .checkpoints
            .load_checkpoint(thread_id)?
            .unwrap_or_else(|| Checkpoint::new(thread_id)))
    }

    fn lease(&self, thread_id: &str) -> Result<ThreadLease, AgentError> {
        self.leases
            .try_acquire(thread_id)
            .ok_or_else(|| AgentError::ThreadBusy {
                thread_id: thread_id.to_string(),
            })
    }

    /// Ordered message log of a thread.
    pub fn thread_messages(&self, thread_id: &str) -> Result<Vec<Message>, AgentError> {
        self.thread(thread_id)?;
        Ok(self.checkpoint(thread_id)?.state.messages)
    }

    // ─── Connection / model selection ───────────────────────────────────────

    /// Select the thread's connections and refresh its schema snapshot.
    ///
    /// An empty selection disconnects the thread. The last query result is
    /// dropped since it belongs to the previous data source.
    pub async fn set_connection(
        &self,
        thread_id: &str,
        connection_ref: Vec<i64>,
    ) -> Result<(), AgentError> {
        let mut thread = self.thread(thread_id)?;
        let _lease = self.lease(thread_id)?;

        let mut selected: Vec<i64> = Vec::with_capacity(connection_ref.len());
        for id in connection_ref {
            if !selected.contains(&id) {
                selected.push(id);
            }
        }

        let snapshot = if selected.is_empty() {
            None
        } else {
            let schema = self
                .connections
                .introspect_schema(thread.owner_id, &selected, &CancellationToken::new())
                .await?;
            Some(schema)
        };

        thread.connection_ref = selected.clone();
        self.threads.update_thread(&thread)?;

        let mut checkpoint = self.checkpoint(thread_id)?;
        checkpoint.state.connection_ref = selected;
        checkpoint.state.db_schema_snapshot = snapshot;
        checkpoint.state.last_query_result = None;
        checkpoint.updated_at = chrono::Utc::now();
        self.checkpoints.save_checkpoint(&checkpoint)?;

        tracing::info!(
            thread_id,
            connections = ?thread.connection_ref,
            schema_bytes = checkpoint.state.db_schema_snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
            "thread connection set"
        );
        Ok(())
    }

    /// Set the thread's model by name or alias; returns the canonical name.
    pub fn set_model(&self, thread_id: &str, name: &str) -> Result<String, AgentError> {
        let mut thread = self.thread(thread_id)?;
        let canonical = self
            .registry
            .canonical_name(name)
            .map(str::to_string)
            .ok_or_else(|| AgentError::UnknownModel {
                name: name.to_string(),
            })?;
        thread.model_name = Some(canonical.clone());
        self.threads.update_thread(&thread)?;
        tracing::info!(thread_id, requested = name, model = %canonical, "thread model set");
        Ok(canonical)
    }

    pub fn get_model(&self, thread_id: &str) -> Result<ModelSelection, AgentError> {
        let thread = self.thread(thread_id)?;
        Ok(ModelSelection {
            current: self
                .registry
                .select(thread.model_name.as_deref())
                .map(str::to_string),
            models: self.registry.availability(),
        })
    }

    // ─── Turns ──────────────────────────────────────────────────────────────

    /// Start a turn. Failures before the turn starts become a single `error`
    /// event.
    pub async fn send_message(&self, thread_id: &str, text: &str) -> TurnStream {
        match self.try_send_message(thread_id, text).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(thread_id, kind = e.kind(), error = %e, "message rejected");
                TurnStream::rejected(e)
            }
        }
    }

    /// Start a turn, returning `ThreadNotFound` / `ThreadBusy` directly.
    pub async fn try_send_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<TurnStream, AgentError> {
        let thread = self.thread(thread_id)?;
        let lease = self.lease(thread_id)?;
        let mut checkpoint = self.checkpoint(thread_id)?;

        if !checkpoint.phase.is_terminal() {
            tracing::warn!(
                thread_id,
                phase = ?checkpoint.phase,
                "abandoning unfinished turn"
            );
        }
        let closed = checkpoint.state.close_dangling_calls();
        if closed > 0 {
            tracing::info!(thread_id, closed, "closed dangling tool calls");
        }

        checkpoint.state.connection_ref = thread.connection_ref.clone();
        if checkpoint.state.db_schema_snapshot.is_none() && !thread.connection_ref.is_empty() {
            self.refresh_snapshot(&thread, &mut checkpoint).await?;
        }

        checkpoint.state.messages.push(Message::user(text));
        checkpoint.phase = TurnPhase::Assistant;
        checkpoint.round = 0;
        checkpoint.updated_at = chrono::Utc::now();
        self.checkpoints.save_checkpoint(&checkpoint)?;

        Ok(self.spawn_turn(thread, checkpoint, lease))
    }

    /// Continue a thread whose last turn stopped before a terminal phase.
    ///
    /// Returns `None` when there is nothing to resume.
    pub fn resume_turn(&self, thread_id: &str) -> Result<Option<TurnStream>, AgentError> {
        let thread = self.thread(thread_id)?;
        let lease = self.lease(thread_id)?;
        let checkpoint = self.checkpoint(thread_id)?;
        if checkpoint.phase.is_terminal() {
            return Ok(None);
        }
        tracing::info!(thread_id, phase = ?checkpoint.phase, round = checkpoint.round, "resuming turn");
        Ok(Some(self.spawn_turn(thread, checkpoint, lease)))
    }

    fn spawn_turn(&self, thread: Thread, checkpoint: Checkpoint, lease: ThreadLease) -> TurnStream {
        let (tx, rx) = mpsc::channel(self.machine.settings().event_buffer.max(1));
        let cancel = CancellationToken::new();
        let machine = self.machine.clone();
        let turn_cancel = cancel.clone();
        tokio::spawn(async move {
            let (_, terminal) = machine.drive(&thread, checkpoint, &tx, &turn_cancel).await;
            drop(lease);
            let _ = tx.send(terminal).await;
        });
        TurnStream::live(rx, cancel)
    }

    /// Introspect a thread whose checkpoint has no snapshot yet.
    ///
    /// Only a secret that cannot be decrypted is fatal here; an unreachable
    /// database leaves the snapshot empty and `ask_database` reports it.
    async fn refresh_snapshot(
        &self,
        thread: &Thread,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), AgentError> {
        match self
            .connections
            .introspect_schema(thread.owner_id, &thread.connection_ref, &CancellationToken::new())
            .await
        {
            Ok(schema) => {
                checkpoint.state.db_schema_snapshot = Some(schema);
                Ok(())
            }
            Err(e @ ConnectionError::DecryptionFailed { .. }) => Err(e.into()),
            Err(e) => {
                tracing::warn!(thread_id = %thread.id, error = %e, "schema refresh failed");
                Ok(())
            }
        }
    }
}
