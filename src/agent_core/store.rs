//! Thread and checkpoint storage seams.
//!
//! The state machine depends only on these traits. [`MemoryStore`] backs
//! tests; [`super::database::SqliteStore`] is the durable implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::errors::AgentError;
use super::types::{Checkpoint, Thread};

/// Thread records.
pub trait ThreadStore: Send + Sync {
    fn create_thread(&self, thread: &Thread) -> Result<(), AgentError>;

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError>;

    /// Persist `model_name` and `connection_ref` of an existing thread.
    fn update_thread(&self, thread: &Thread) -> Result<(), AgentError>;
}

/// Latest checkpoint per thread.
pub trait CheckpointStore: Send + Sync {
    fn load_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError>;

    /// Replace the thread's checkpoint.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AgentError>;
}

// ─── In-memory store ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    threads: Mutex<HashMap<String, Thread>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AgentError> {
    mutex.lock().map_err(|_| AgentError::StorageError {
        reason: "store lock poisoned".into(),
    })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for MemoryStore {
    fn create_thread(&self, thread: &Thread) -> Result<(), AgentError> {
        lock(&self.threads)?.insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        Ok(lock(&self.threads)?.get(thread_id).cloned())
    }

    fn update_thread(&self, thread: &Thread) -> Result<(), AgentError> {
        match lock(&self.threads)?.get_mut(&thread.id) {
            Some(existing) => {
                *existing = thread.clone();
                Ok(())
            }
            None => Err(AgentError::ThreadNotFound {
                thread_id: thread.id.clone(),
            }),
        }
    }
}

impl CheckpointStore for MemoryStore {
    fn load_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(lock(&self.checkpoints)?.get(thread_id).cloned())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        lock(&self.checkpoints)?.insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::TurnPhase;

    #[test]
    fn test_memory_thread_roundtrip() {
        let store = MemoryStore::new();
        let mut thread = Thread::new(7);
        store.create_thread(&thread).unwrap();

        thread.model_name = Some("qwen3-8b".into());
        store.update_thread(&thread).unwrap();
        let loaded = store.get_thread(&thread.id).unwrap().unwrap();
        assert_eq!(loaded.model_name.as_deref(), Some("qwen3-8b"));

        assert!(store.get_thread("missing").unwrap().is_none());
        assert!(matches!(
            store.update_thread(&Thread::new(1)),
            Err(AgentError::ThreadNotFound { .. })
        ));
    }

    #[test]
    fn test_memory_checkpoint_replaces() {
        let store = MemoryStore::new();
        let mut cp = Checkpoint::new("t1");
        store.save_checkpoint(&cp).unwrap();
        cp.phase = TurnPhase::Tools { next: 1 };
        store.save_checkpoint(&cp).unwrap();
        let loaded = store.load_checkpoint("t1").unwrap().unwrap();
        assert_eq!(loaded.phase, TurnPhase::Tools { next: 1 });
    }
}
