//! Per-role conversation threads.
//!
//! Each agent owns one [`ThreadStore`]; stores are never shared between
//! roles, so the same thread id in two stores names two unrelated
//! conversations. History lives in process memory only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::llm::ChatMessage;

/// Opaque identifier of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Default)]
struct Thread {
    messages: Vec<ChatMessage>,
    /// Held for the duration of one agent turn on this thread.
    turn: Arc<Mutex<()>>,
}

/// In-memory, append-only message history keyed by thread id.
#[derive(Debug, Clone, Default)]
pub struct ThreadStore {
    threads: Arc<RwLock<HashMap<ThreadId, Thread>>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message, creating the thread on first use.
    pub async fn append(&self, thread_id: &ThreadId, message: ChatMessage) {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.clone())
            .or_default()
            .messages
            .push(message);
    }

    /// Append messages in order.
    pub async fn extend(&self, thread_id: &ThreadId, messages: impl IntoIterator<Item = ChatMessage>) {
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.clone())
            .or_default()
            .messages
            .extend(messages);
    }

    /// Ordered copy of a thread's messages; empty for unknown threads.
    pub async fn history(&self, thread_id: &ThreadId) -> Vec<ChatMessage> {
        let threads = self.threads.read().await;
        threads
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self, thread_id: &ThreadId) -> usize {
        let threads = self.threads.read().await;
        threads.get(thread_id).map_or(0, |t| t.messages.len())
    }

    /// Drop a thread's history. Returns whether it existed.
    pub async fn reset(&self, thread_id: &ThreadId) -> bool {
        let existed = self.threads.write().await.remove(thread_id).is_some();
        if existed {
            tracing::debug!(thread = %thread_id, "Thread reset");
        }
        existed
    }

    pub async fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.read().await.keys().cloned().collect()
    }

    /// Take the turn lock of a thread so two turns never interleave.
    pub async fn lock_turn(&self, thread_id: &ThreadId) -> OwnedMutexGuard<()> {
        let turn = {
            let mut threads = self.threads.write().await;
            threads.entry(thread_id.clone()).or_default().turn.clone()
        };
        turn.lock_owned().await
    }
}
