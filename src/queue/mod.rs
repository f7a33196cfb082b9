//! Four-band FIFO priority queue with retry backoff
//!
//! Bands drain strictly `critical > high > normal > low`; within a band the
//! order is FIFO. Retried entries re-enter the band they came from with an
//! `earliest_run_at` backoff timestamp, which `dequeue` honors. A single
//! lock serializes enqueue/dequeue/mark_* transitions.

use crate::models::Priority;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const BAND_ORDER: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];

/// One queued unit of dispatchable work.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: String,
    pub input: String,
    pub selected_agent: Option<String>,
    pub priority: Priority,
    pub attempts: u32,
    pub max_retries: u32,
    pub earliest_run_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        task_id: impl Into<String>,
        input: impl Into<String>,
        selected_agent: Option<String>,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            input: input.into(),
            selected_agent,
            priority,
            attempts: 0,
            max_retries,
            earliest_run_at: None,
            enqueued_at: Utc::now(),
        }
    }

    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.earliest_run_at.map_or(true, |t| t <= now)
    }
}

/// Outcome of `mark_failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Requeued { next_run_at: DateTime<Utc>, attempt: u32 },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedState {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FinishedEntry {
    pub entry: QueueEntry,
    pub state: FinishedState,
    pub finished_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    bands: HashMap<Priority, VecDeque<QueueEntry>>,
    assigned: HashMap<String, QueueEntry>,
    running: HashMap<String, QueueEntry>,
    history: VecDeque<FinishedEntry>,
}

/// Priority-banded dispatch queue.
#[derive(Clone)]
pub struct PriorityQueue {
    inner: Arc<Mutex<QueueInner>>,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    history_capacity: usize,
}

impl PriorityQueue {
    pub fn new(base_backoff_ms: u64, max_backoff_ms: u64, history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            base_backoff_ms,
            max_backoff_ms,
            history_capacity,
        }
    }

    pub async fn enqueue(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock().await;
        debug!(
            "Enqueued task {} at {:?} (attempt {})",
            entry.task_id, entry.priority, entry.attempts
        );
        inner
            .bands
            .entry(entry.priority)
            .or_default()
            .push_back(entry);
    }

    /// The oldest eligible entry in the highest non-empty band, moved to the
    /// assigned set. Entries still inside their backoff window are skipped.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        for priority in BAND_ORDER {
            let Some(band) = inner.bands.get_mut(&priority) else {
                continue;
            };
            let Some(pos) = band.iter().position(|e| e.is_eligible(now)) else {
                continue;
            };
            let entry = band.remove(pos)?;
            inner.assigned.insert(entry.task_id.clone(), entry.clone());
            debug!("Dequeued task {} from {:?}", entry.task_id, priority);
            return Some(entry);
        }
        None
    }

    pub async fn mark_running(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.assigned.remove(task_id) {
            Some(entry) => {
                inner.running.insert(task_id.to_string(), entry);
                true
            }
            None => false,
        }
    }

    pub async fn mark_completed(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let taken = inner
            .running
            .remove(task_id)
            .or_else(|| inner.assigned.remove(task_id));
        match taken {
            Some(entry) => {
                Self::push_history(&mut inner, entry, FinishedState::Completed, self.history_capacity);
                true
            }
            None => false,
        }
    }

    /// Fail an entry, re-inserting it at the back of its band with an
    /// exponential backoff delay while the retry budget allows.
    pub async fn mark_failed(&self, task_id: &str, retry: bool) -> RetryDecision {
        let mut inner = self.inner.lock().await;
        let taken = inner
            .running
            .remove(task_id)
            .or_else(|| inner.assigned.remove(task_id));
        let Some(mut entry) = taken else {
            return RetryDecision::Exhausted;
        };

        if retry && entry.attempts < entry.max_retries {
            entry.attempts += 1;
            let delay_ms =
                (self.base_backoff_ms.saturating_mul(1 << entry.attempts)).min(self.max_backoff_ms);
            let next_run_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
            entry.earliest_run_at = Some(next_run_at);
            let attempt = entry.attempts;
            info!(
                "Requeueing task {} for attempt {} in {}ms",
                task_id, attempt, delay_ms
            );
            inner
                .bands
                .entry(entry.priority)
                .or_default()
                .push_back(entry);
            RetryDecision::Requeued {
                next_run_at,
                attempt,
            }
        } else {
            Self::push_history(&mut inner, entry, FinishedState::Failed, self.history_capacity);
            RetryDecision::Exhausted
        }
    }

    /// Remove a task from any band or the running set.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let mut found = inner
            .running
            .remove(task_id)
            .or_else(|| inner.assigned.remove(task_id));
        if found.is_none() {
            for band in inner.bands.values_mut() {
                if let Some(pos) = band.iter().position(|e| e.task_id == task_id) {
                    found = band.remove(pos);
                    break;
                }
            }
        }
        match found {
            Some(entry) => {
                info!("Cancelled queued task {}", task_id);
                Self::push_history(&mut inner, entry, FinishedState::Cancelled, self.history_capacity);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.bands.values().map(VecDeque::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn depth_of(&self, priority: Priority) -> usize {
        let inner = self.inner.lock().await;
        inner.bands.get(&priority).map_or(0, VecDeque::len)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    pub async fn history(&self) -> Vec<FinishedEntry> {
        let inner = self.inner.lock().await;
        inner.history.iter().cloned().collect()
    }

    fn push_history(
        inner: &mut QueueInner,
        entry: QueueEntry,
        state: FinishedState,
        capacity: usize,
    ) {
        if inner.history.len() >= capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(FinishedEntry {
            entry,
            state,
            finished_at: Utc::now(),
        });
    }
}
