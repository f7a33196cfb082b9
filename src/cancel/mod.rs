//! Cancellation registry: one abort handle per live task id
//!
//! Every blocking operation in the core races the task's token; the loser's
//! result is dropped. Aborts propagate transitively through child tokens:
//! workflow -> node -> agent handler -> model/tool call.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct CancelEntry {
    token: CancellationToken,
    reason: Option<String>,
}

/// Map of task id -> cancellation handle with hierarchical linkage.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    entries: Arc<Mutex<HashMap<String, CancelEntry>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the handle for a task. Idempotent: repeated calls for
    /// the same id return clones of the same token.
    pub async fn acquire(&self, task_id: &str) -> CancellationToken {
        let mut entries = self.entries.lock().await;
        entries
            .entry(task_id.to_string())
            .or_insert_with(|| CancelEntry {
                token: CancellationToken::new(),
                reason: None,
            })
            .token
            .clone()
    }

    /// Mark the task cancelled and wake every observer. Idempotent: the
    /// first reason wins, later aborts are no-ops.
    pub async fn abort(&self, task_id: &str, reason: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(task_id.to_string())
            .or_insert_with(|| CancelEntry {
                token: CancellationToken::new(),
                reason: None,
            });
        if entry.reason.is_none() {
            entry.reason = Some(reason.to_string());
            info!("Aborting task {}: {}", task_id, reason);
        }
        entry.token.cancel();
    }

    /// Propagate a parent task's abort to a child token.
    pub async fn link(&self, parent_id: &str, child: CancellationToken) {
        let parent = self.acquire(parent_id).await;
        tokio::spawn(async move {
            parent.cancelled().await;
            child.cancel();
        });
    }

    /// Drop the handle for a task. Releasing after an abort does not
    /// resurrect the task; observers already saw the cancellation.
    pub async fn release(&self, task_id: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(task_id).is_some() {
            debug!("Released cancellation handle for {}", task_id);
        }
    }

    pub async fn is_cancelled(&self, task_id: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(task_id)
            .map(|e| e.token.is_cancelled())
            .unwrap_or(false)
    }

    pub async fn reason(&self, task_id: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries.get(task_id).and_then(|e| e.reason.clone())
    }

    pub async fn live_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
