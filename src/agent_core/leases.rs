//! Per-thread turn leases.
//!
//! A thread runs at most one turn at a time. The lease is taken before the
//! turn task is spawned and released when the [`ThreadLease`] guard drops, on
//! success, failure, panic or client disconnect alike.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Clone, Default)]
pub struct ThreadLeases {
    held: Arc<DashMap<String, Instant>>,
}

impl ThreadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `thread_id`, or `None` if a turn already holds it.
    pub fn try_acquire(&self, thread_id: &str) -> Option<ThreadLease> {
        match self.held.entry(thread_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(ThreadLease {
                    held: Arc::clone(&self.held),
                    thread_id: thread_id.to_string(),
                })
            }
        }
    }

    pub fn is_held(&self, thread_id: &str) -> bool {
        self.held.contains_key(thread_id)
    }
}

/// Exclusive right to run a turn on one thread.
pub struct ThreadLease {
    held: Arc<DashMap<String, Instant>>,
    thread_id: String,
}

impl ThreadLease {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        if let Some((_, since)) = self.held.remove(&self.thread_id) {
            tracing::debug!(
                thread_id = %self.thread_id,
                held_ms = since.elapsed().as_millis() as u64,
                "thread lease released"
            );
        }
    }
}
