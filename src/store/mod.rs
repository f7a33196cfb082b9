//! Durable task store: records, retry chains, conversations, worker leases
//!
//! The store is the sole authority for durable task state. A single mutex
//! serializes updates per id (compare-and-set for leases, last-write-wins
//! for everything else); all other components hold task ids only.
//!
//! The backing driver is an in-memory map; swapping it for an embedded KV
//! or relational driver changes nothing above this module's API.

use crate::{
    models::{
        AgentDecision, ErrorInfo, GenerationConfig, Lease, SystemMode, TaskRecord, TaskStatus,
    },
    ForgeError, Result,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Creation parameters for a new task record.
#[derive(Debug, Default, Clone)]
pub struct NewTask {
    pub id: Option<String>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub selection_reason: Option<String>,
    pub decision: Option<AgentDecision>,
    pub generation: Option<GenerationConfig>,
    pub system_mode: Option<SystemMode>,
    pub multi_agent: bool,
    pub metadata: HashMap<String, String>,
}

/// Partial update applied to a record. Unset fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub output: Option<String>,
    pub error: Option<ErrorInfo>,
    pub progress: Option<u8>,
    pub agent_id: Option<String>,
    pub involved_agents: Option<Vec<String>>,
    pub selection_reason: Option<String>,
}

/// Query filter for `query`.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_retry: Option<bool>,
    pub original_task_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_by: Option<SortBy>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    StartedAt,
    CompletedAt,
    DurationMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Durable store of task records and lease state.
#[derive(Clone, Default)]
pub struct TaskStore {
    records: Arc<Mutex<HashMap<String, TaskRecord>>>,
}

/// Whether a status change moves forward in the task lifecycle.
/// Terminal states accept nothing; a record never re-enters `pending`.
fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskStatus::Pending => matches!(
            to,
            TaskStatus::InProgress
                | TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        ),
        TaskStatus::InProgress => matches!(
            to,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ),
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending record with start time set. Equal-id upserts
    /// replace atomically.
    pub async fn create(&self, input: impl Into<String>, meta: NewTask) -> TaskRecord {
        let mut record = TaskRecord::new(meta.id, input.into());
        record.agent_id = meta.agent_id;
        if let Some(conv) = meta.conversation_id {
            record.conversation_id = conv;
        }
        record.selection_reason = meta.selection_reason;
        record.decision = meta.decision;
        if let Some(generation) = meta.generation {
            record.generation = generation;
        }
        record.system_mode = meta.system_mode;
        record.multi_agent = meta.multi_agent;
        record.metadata = meta.metadata;

        let mut records = self.records.lock().await;
        records.insert(record.id.clone(), record.clone());
        debug!("Created task record {}", record.id);
        record
    }

    /// Apply a partial update. A status change that would move the record
    /// backwards (or out of a terminal state) is ignored; a cancelled task
    /// in particular never becomes completed. Transitions into a terminal
    /// state stamp `completed_at` and `duration_ms` when absent.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Option<TaskRecord> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id)?;

        if let Some(status) = patch.status {
            if transition_allowed(record.status, status) {
                record.status = status;
                if status.is_terminal() {
                    let completed = record.completed_at.get_or_insert_with(Utc::now);
                    if record.duration_ms.is_none() {
                        record.duration_ms =
                            Some((*completed - record.started_at).num_milliseconds());
                    }
                }
            } else {
                warn!(
                    "Ignoring status transition {} -> {} for task {}",
                    record.status, status, id
                );
            }
        }

        if let Some(output) = patch.output {
            record.output = Some(output);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        if let Some(progress) = patch.progress {
            record.progress = progress.min(100);
        }
        if let Some(agent_id) = patch.agent_id {
            record.agent_id = Some(agent_id);
        }
        if let Some(involved) = patch.involved_agents {
            record.involved_agents = involved;
        }
        if let Some(reason) = patch.selection_reason {
            record.selection_reason = Some(reason);
        }

        Some(record.clone())
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        let records = self.records.lock().await;
        records.get(id).cloned()
    }

    /// Filtered, sorted, paginated listing.
    pub async fn query(&self, filter: TaskFilter) -> Vec<TaskRecord> {
        let records = self.records.lock().await;
        let mut matched: Vec<TaskRecord> = records
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                filter
                    .agent
                    .as_ref()
                    .map_or(true, |a| r.agent_id.as_deref() == Some(a.as_str()))
            })
            .filter(|r| filter.start_date.map_or(true, |d| r.started_at >= d))
            .filter(|r| filter.end_date.map_or(true, |d| r.started_at <= d))
            .filter(|r| filter.is_retry.map_or(true, |v| r.is_retry == v))
            .filter(|r| {
                filter
                    .original_task_id
                    .as_ref()
                    .map_or(true, |o| r.original_task_id.as_deref() == Some(o.as_str()))
            })
            .cloned()
            .collect();

        let sort_by = filter.sort_by.unwrap_or(SortBy::StartedAt);
        matched.sort_by(|a, b| {
            let ordering = match sort_by {
                SortBy::StartedAt => a.started_at.cmp(&b.started_at),
                SortBy::CompletedAt => a.completed_at.cmp(&b.completed_at),
                SortBy::DurationMs => a.duration_ms.cmp(&b.duration_ms),
            };
            match filter.sort_order.unwrap_or(SortOrder::Asc) {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(offset).take(limit).collect()
    }

    /// Create a retry record for a task, linking the lineage both ways.
    ///
    /// Retries always anchor on the chain root, so retrying a retry extends
    /// the original's `retries` list rather than nesting chains.
    pub async fn create_retry(
        &self,
        original_id: &str,
        new_input: Option<String>,
    ) -> Result<TaskRecord> {
        let mut records = self.records.lock().await;

        let source = records
            .get(original_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("task {original_id}")))?;
        let anchor_id = source
            .original_task_id
            .clone()
            .unwrap_or_else(|| source.id.clone());
        let anchor = records
            .get(&anchor_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("task {anchor_id}")))?;

        let mut retry = TaskRecord::new(None, new_input.unwrap_or_else(|| anchor.input.clone()));
        retry.agent_id = anchor.agent_id.clone();
        retry.conversation_id = anchor.conversation_id.clone();
        retry.generation = anchor.generation.clone();
        retry.system_mode = anchor.system_mode;
        retry.is_retry = true;
        retry.original_task_id = Some(anchor_id.clone());
        retry.retry_count = anchor.retries.len() as u32 + 1;

        if let Some(root) = records.get_mut(&anchor_id) {
            root.retries.push(retry.id.clone());
        }
        records.insert(retry.id.clone(), retry.clone());

        info!(
            "Created retry {} (attempt {}) for task {}",
            retry.id, retry.retry_count, anchor_id
        );
        Ok(retry)
    }

    /// The original record followed by every retry, in order.
    pub async fn get_retry_chain(&self, id: &str) -> Vec<TaskRecord> {
        let records = self.records.lock().await;
        let Some(record) = records.get(id) else {
            return Vec::new();
        };
        let anchor_id = record.original_task_id.as_deref().unwrap_or(&record.id);
        let Some(anchor) = records.get(anchor_id) else {
            return Vec::new();
        };

        let mut chain = vec![anchor.clone()];
        for retry_id in &anchor.retries {
            if let Some(retry) = records.get(retry_id) {
                chain.push(retry.clone());
            }
        }
        chain
    }

    /// Atomic rename: moves the record and rewrites every lineage reference
    /// to the old id.
    pub async fn rekey(&self, old_id: &str, new_id: &str) -> Option<TaskRecord> {
        let mut records = self.records.lock().await;
        let mut record = records.remove(old_id)?;
        record.id = new_id.to_string();
        if record.conversation_id == old_id {
            record.conversation_id = new_id.to_string();
        }

        for other in records.values_mut() {
            if other.original_task_id.as_deref() == Some(old_id) {
                other.original_task_id = Some(new_id.to_string());
            }
            for retry_id in other.retries.iter_mut() {
                if retry_id == old_id {
                    *retry_id = new_id.to_string();
                }
            }
        }

        records.insert(new_id.to_string(), record.clone());
        info!("Rekeyed task {} -> {}", old_id, new_id);
        Some(record)
    }

    pub async fn delete(&self, id: &str) -> bool {
        let mut records = self.records.lock().await;
        records.remove(id).is_some()
    }

    pub async fn delete_by_conversation(&self, conversation_id: &str) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.conversation_id != conversation_id);
        before - records.len()
    }

    /// Remove terminal records older than the retention window.
    pub async fn delete_older_than(&self, days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(days);
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| {
            !r.status.is_terminal() || r.completed_at.map_or(true, |c| c > cutoff)
        });
        let removed = before - records.len();
        if removed > 0 {
            info!("Retention sweep removed {} task records", removed);
        }
        removed
    }

    /// Latest completed turns of a conversation, oldest first.
    pub async fn conversation_history(&self, conversation_id: &str, limit: usize) -> Vec<TaskRecord> {
        let records = self.records.lock().await;
        let mut turns: Vec<TaskRecord> = records
            .values()
            .filter(|r| r.conversation_id == conversation_id)
            .filter(|r| r.status == TaskStatus::Completed)
            .cloned()
            .collect();
        turns.sort_by_key(|r| r.completed_at);
        let skip = turns.len().saturating_sub(limit);
        turns.into_iter().skip(skip).collect()
    }

    /// Claim a task for a worker. Succeeds only when the record is in
    /// `pending` or `in_progress` and its lease is absent or expired.
    pub async fn claim(&self, task_id: &str, worker_id: &str, lease_ms: u64) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_id) else {
            return false;
        };
        if !matches!(
            record.status,
            TaskStatus::Pending | TaskStatus::InProgress
        ) {
            return false;
        }

        let now = Utc::now();
        if let Some(lease) = &record.lease {
            if lease.lease_expires_at > now {
                debug!(
                    "Claim rejected for {}: lease held by {} until {}",
                    task_id, lease.worker_id, lease.lease_expires_at
                );
                return false;
            }
        }

        let claim_count = record.lease.as_ref().map(|l| l.claim_count).unwrap_or(0) + 1;
        record.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            lease_expires_at: now + Duration::milliseconds(lease_ms as i64),
            last_claimed_at: now,
            claim_count,
        });
        record.status = TaskStatus::InProgress;
        info!(
            "Worker {} claimed task {} (claim #{})",
            worker_id, task_id, claim_count
        );
        true
    }

    /// Extend the caller's own unexpired lease. A mismatched or expired
    /// lease cannot be renewed, only re-claimed.
    pub async fn renew(&self, task_id: &str, worker_id: &str, lease_ms: u64) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(task_id) else {
            return false;
        };
        let now = Utc::now();
        match record.lease.as_mut() {
            Some(lease) if lease.worker_id == worker_id && lease.lease_expires_at > now => {
                lease.lease_expires_at = now + Duration::milliseconds(lease_ms as i64);
                true
            }
            _ => false,
        }
    }

    /// Startup normalization: every record still `pending` or `in_progress`
    /// failed with the process that died. Guarantees no record survives a
    /// restart in a live state.
    pub async fn normalize_on_startup(&self) -> usize {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let mut normalized = 0;
        for record in records.values_mut() {
            if matches!(
                record.status,
                TaskStatus::Pending | TaskStatus::InProgress
            ) {
                record.status = TaskStatus::Failed;
                record.error = Some(ErrorInfo::new("Task failed after server restart"));
                record.completed_at = Some(now);
                record.duration_ms = Some((now - record.started_at).num_milliseconds());
                record.lease = None;
                normalized += 1;
            }
        }
        if normalized > 0 {
            warn!("Startup normalization failed {} stale tasks", normalized);
        }
        normalized
    }

    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }
}
