//! In-process typed pub/sub keyed by task id
//!
//! Publishers are any component; subscribers are persistence, observability
//! and the SSE transport. Delivery is best-effort and ordered per task id.
//! The bus retains a bounded ring of events per task for replay and UI
//! reconnection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// Event kinds emitted by the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentRegistered,
    AgentStarted,
    AgentStopped,
    AgentBusy,
    AgentIdle,
    TaskQueued,
    TaskStarted,
    TaskStep,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    ToolCalled,
    ToolCompleted,
    IpcMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentStopped => "agent.stopped",
            EventKind::AgentBusy => "agent.busy",
            EventKind::AgentIdle => "agent.idle",
            EventKind::TaskQueued => "task.queued",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskStep => "task.step",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskCancelled => "task.cancelled",
            EventKind::ToolCalled => "tool.called",
            EventKind::ToolCompleted => "tool.completed",
            EventKind::IpcMessage => "ipc.message",
        }
    }
}

/// One event on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub data: serde_json::Value,
}

type Handler = Arc<dyn Fn(&TaskEvent) -> crate::Result<()> + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Process-wide event bus
///
/// Publishing never blocks the caller on subscriber work: handlers run
/// inline but their failures are logged, not re-raised. The per-task ring
/// is append-only and permits concurrent readers.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(u64, Handler)>>>,
    rings: RwLock<HashMap<String, VecDeque<TaskEvent>>>,
    ring_capacity: usize,
    firehose: broadcast::Sender<TaskEvent>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(ring_capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(256);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            rings: RwLock::new(HashMap::new()),
            ring_capacity,
            firehose,
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event to every subscriber of its kind.
    pub async fn publish(
        &self,
        kind: EventKind,
        task_id: Option<&str>,
        agent_id: Option<&str>,
        data: serde_json::Value,
    ) {
        let event = TaskEvent {
            kind,
            timestamp: Utc::now(),
            task_id: task_id.map(str::to_string),
            agent_id: agent_id.map(str::to_string),
            data,
        };

        if let Some(id) = &event.task_id {
            let mut rings = self.rings.write().await;
            let ring = rings.entry(id.clone()).or_default();
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // Snapshot handlers so publishing never holds the lock across a call
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&kind)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(&event) {
                warn!("Event handler failed for {}: {}", kind.as_str(), e);
            }
        }

        // Firehose send only fails when nobody is listening
        let _ = self.firehose.send(event);

        debug!(
            "Published {} (task: {:?})",
            kind.as_str(),
            task_id.unwrap_or("-")
        );
    }

    /// Subscribe a handler to one event kind.
    pub async fn subscribe(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(kind).or_default().push((id, handler));
        SubscriptionId(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.write().await;
        for handlers in subscribers.values_mut() {
            handlers.retain(|(hid, _)| *hid != id.0);
        }
    }

    /// A receiver of every event, regardless of kind. Used by the SSE
    /// transport; lagging receivers drop events rather than block the bus.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TaskEvent> {
        self.firehose.subscribe()
    }

    /// Replay the newest `limit` events recorded for a task.
    pub async fn history(&self, task_id: &str, limit: usize) -> Vec<TaskEvent> {
        let rings = self.rings.read().await;
        match rings.get(task_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop the ring for a task (retention sweep).
    pub async fn forget(&self, task_id: &str) {
        let mut rings = self.rings.write().await;
        rings.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn subscribers_receive_matching_kind_only() {
        let bus = EventBus::new(10);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        bus.subscribe(
            EventKind::TaskCompleted,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await;

        bus.publish(EventKind::TaskQueued, Some("t1"), None, json!({}))
            .await;
        bus.publish(EventKind::TaskCompleted, Some("t1"), None, json!({}))
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ring_is_bounded_and_ordered() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(EventKind::TaskStep, Some("t1"), None, json!({ "seq": i }))
                .await;
        }

        let history = bus.history("t1", 10).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data["seq"], 2);
        assert_eq!(history[2].data["seq"], 4);
    }

    #[tokio::test]
    async fn handler_failure_does_not_poison_the_bus() {
        let bus = EventBus::new(10);
        bus.subscribe(
            EventKind::TaskFailed,
            Arc::new(|_| Err(crate::ForgeError::Transient("flaky sink".into()))),
        )
        .await;

        // Publishing must survive the failing handler
        bus.publish(EventKind::TaskFailed, Some("t1"), None, json!({}))
            .await;
        assert_eq!(bus.history("t1", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let bus = EventBus::new(10);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = bus
            .subscribe(
                EventKind::TaskQueued,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        bus.publish(EventKind::TaskQueued, Some("t1"), None, json!({}))
            .await;
        bus.unsubscribe(sub).await;
        bus.publish(EventKind::TaskQueued, Some("t1"), None, json!({}))
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
