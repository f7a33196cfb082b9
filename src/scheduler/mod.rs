//! Scheduler: priority dispatch with retry backoff and a concurrency cap
//!
//! Binds the queue, the agent registry and the kernel. `process_next`
//! dequeues one entry, selects an agent, and spawns the kernel invocation;
//! the running counter enforces `max_concurrent_tasks` at every instant.

use crate::{
    cancel::CancellationRegistry,
    constants::{TASK_POLL_INTERVAL_MS, WAIT_POLL_INTERVAL_MS},
    events::{EventBus, EventKind},
    kernel::Kernel,
    models::{ErrorInfo, Priority, QueuedPayload, TaskRecord, TaskStatus},
    queue::{PriorityQueue, QueueEntry, RetryDecision},
    store::{NewTask, TaskPatch, TaskStore},
    agents::{AgentRegistry, RuntimeContext},
    ForgeError, Result,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: crate::constants::DEFAULT_MAX_CONCURRENT_TASKS,
            base_backoff_ms: crate::constants::DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: crate::constants::DEFAULT_MAX_BACKOFF_MS,
            default_max_retries: crate::constants::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Options accepted by `submit`.
#[derive(Debug, Default, Clone)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub agent_id: Option<String>,
    pub agent_tag: Option<String>,
    pub max_retries: Option<u32>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Priority-queue driven task dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<PriorityQueue>,
    registry: Arc<AgentRegistry>,
    kernel: Arc<Kernel>,
    store: Arc<TaskStore>,
    cancellations: Arc<CancellationRegistry>,
    bus: Arc<EventBus>,
    running: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PriorityQueue>,
        registry: Arc<AgentRegistry>,
        kernel: Arc<Kernel>,
        store: Arc<TaskStore>,
        cancellations: Arc<CancellationRegistry>,
        bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            kernel,
            store,
            cancellations,
            bus,
            running: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Register a task record and place it on the queue.
    pub async fn submit(
        &self,
        name: &str,
        input: impl Into<String>,
        options: SubmitOptions,
    ) -> Result<TaskRecord> {
        let input = input.into();
        let mut metadata = options.metadata.clone();
        metadata.insert("name".to_string(), name.to_string());
        if let Some(tag) = &options.agent_tag {
            metadata.insert("agent_tag".to_string(), tag.clone());
        }

        let record = self
            .store
            .create(
                input.clone(),
                NewTask {
                    agent_id: options.agent_id.clone(),
                    metadata,
                    ..Default::default()
                },
            )
            .await;

        let entry = QueueEntry::new(
            &record.id,
            input.clone(),
            options.agent_id.clone(),
            options.priority,
            options.max_retries.unwrap_or(self.config.default_max_retries),
        );
        self.queue.enqueue(entry).await;

        // Announce with the inter-worker wire shape so external consumers
        // can pick the entry up from the stream
        let payload = QueuedPayload {
            task_id: record.id.clone(),
            input,
            selected_agent_id: options.agent_id,
            registered_task_id: record.id.clone(),
            agent_type: options.agent_tag.unwrap_or_else(|| name.to_string()),
            multi_agent_config: None,
            priority: options.priority as i64,
            meta: options.metadata,
        };
        self.bus
            .publish(
                EventKind::TaskQueued,
                Some(record.id.as_str()),
                record.agent_id.as_deref(),
                serde_json::to_value(&payload).unwrap_or_else(|_| json!({ "name": name })),
            )
            .await;

        Ok(record)
    }

    /// Dispatch one queued entry if the concurrency budget allows.
    /// Returns true when an entry was dispatched (or drained as cancelled).
    pub async fn process_next(&self) -> Result<bool> {
        if self.running.load(Ordering::SeqCst) >= self.config.max_concurrent {
            return Ok(false);
        }
        let Some(entry) = self.queue.dequeue().await else {
            return Ok(false);
        };

        // Cancelled while queued: drain without executing
        if self.cancellations.is_cancelled(&entry.task_id).await {
            self.queue.cancel(&entry.task_id).await;
            self.finalize_cancelled(&entry.task_id).await;
            return Ok(true);
        }

        let Some(agent_id) = self.select_agent(&entry).await else {
            warn!("No agent available for task {}", entry.task_id);
            self.queue.mark_failed(&entry.task_id, false).await;
            let err = ForgeError::Unavailable(format!("task {}", entry.task_id));
            self.store
                .update(
                    &entry.task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Failed),
                        error: Some(ErrorInfo::from_error(&err)),
                        ..Default::default()
                    },
                )
                .await;
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.bus
                .publish(
                    EventKind::TaskFailed,
                    Some(entry.task_id.as_str()),
                    None,
                    json!({ "error": err.to_string() }),
                )
                .await;
            return Ok(true);
        };

        let wait_ms = (Utc::now() - entry.enqueued_at).num_milliseconds().max(0);
        self.queue.mark_running(&entry.task_id).await;
        self.store
            .update(
                &entry.task_id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    agent_id: Some(agent_id.clone()),
                    ..Default::default()
                },
            )
            .await;
        self.bus
            .publish(
                EventKind::TaskStep,
                Some(entry.task_id.as_str()),
                Some(agent_id.as_str()),
                json!({ "phase": "executing", "attempt": entry.attempts + 1, "wait_ms": wait_ms }),
            )
            .await;

        self.running.fetch_add(1, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.execute_entry(entry, agent_id).await;
            scheduler.running.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(true)
    }

    /// Drain the queue until the concurrency budget saturates or the queue
    /// is empty.
    pub async fn process_all(&self) -> Result<usize> {
        let mut dispatched = 0;
        while self.process_next().await? {
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Poll a task to a terminal state, honoring cancellation.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<TaskRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self
                .store
                .get(task_id)
                .await
                .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ForgeError::Timeout(format!(
                    "task {task_id} still {} after {:?}",
                    record.status, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(WAIT_POLL_INTERVAL_MS)).await;
        }
    }

    /// Cancel a task wherever it currently lives: the queue, or a running
    /// handler via the cancellation registry.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let record = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;
        if record.status.is_terminal() {
            return Err(ForgeError::Conflict(format!(
                "task {task_id} already {}",
                record.status
            )));
        }

        self.queue.cancel(task_id).await;
        self.cancellations.abort(task_id, "cancelled by request").await;
        self.finalize_cancelled(task_id).await;
        Ok(())
    }

    /// Background dispatch loop for the composition root.
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler loop started (max {} concurrent)",
            self.config.max_concurrent
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler loop stopping");
                    return;
                }
                dispatched = self.process_next() => {
                    if !dispatched.unwrap_or(false) {
                        tokio::time::sleep(Duration::from_millis(TASK_POLL_INTERVAL_MS)).await;
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue.len().await,
            running: self.running.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    async fn select_agent(&self, entry: &QueueEntry) -> Option<String> {
        if let Some(agent_id) = &entry.selected_agent {
            if self.registry.is_registered(agent_id).await {
                return Some(agent_id.clone());
            }
            return None;
        }
        let record = self.store.get(&entry.task_id).await;
        if let Some(tag) = record.and_then(|r| r.metadata.get("agent_tag").cloned()) {
            if let Some(agent_id) = self.registry.first_with_tag(&tag).await {
                return Some(agent_id);
            }
            return None;
        }
        self.registry.random_id().await
    }

    async fn execute_entry(&self, entry: QueueEntry, agent_id: String) {
        let cancel = self.cancellations.acquire(&entry.task_id).await;
        let ctx = RuntimeContext {
            task_id: entry.task_id.clone(),
            cancel,
        };
        let input = json!({ "task_id": entry.task_id, "query": entry.input });

        match self.kernel.run(&agent_id, input, ctx).await {
            Ok((_execution_id, output)) => {
                self.queue.mark_completed(&entry.task_id).await;
                self.completed.fetch_add(1, Ordering::SeqCst);
                self.store
                    .update(
                        &entry.task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Completed),
                            output: Some(output),
                            progress: Some(100),
                            involved_agents: Some(vec![agent_id]),
                            ..Default::default()
                        },
                    )
                    .await;
                self.cancellations.release(&entry.task_id).await;
            }
            Err(ForgeError::Cancelled(_)) => {
                self.queue.cancel(&entry.task_id).await;
                self.finalize_cancelled(&entry.task_id).await;
            }
            Err(err) => {
                match self.queue.mark_failed(&entry.task_id, err.is_retryable()).await {
                    RetryDecision::Requeued { next_run_at, attempt } => {
                        debug!(
                            "Task {} scheduled for retry {} at {}",
                            entry.task_id, attempt, next_run_at
                        );
                        self.bus
                            .publish(
                                EventKind::TaskStep,
                                Some(entry.task_id.as_str()),
                                None,
                                json!({
                                    "phase": "retrying",
                                    "attempt": attempt,
                                    "next_run_at": next_run_at.to_rfc3339(),
                                }),
                            )
                            .await;
                        // The record stays in_progress; the retried attempt
                        // reuses the same cancellation handle.
                    }
                    RetryDecision::Exhausted => {
                        self.store
                            .update(
                                &entry.task_id,
                                TaskPatch {
                                    status: Some(TaskStatus::Failed),
                                    error: Some(ErrorInfo::from_error(&err)),
                                    ..Default::default()
                                },
                            )
                            .await;
                        self.failed.fetch_add(1, Ordering::SeqCst);
                        self.cancellations.release(&entry.task_id).await;
                    }
                }
            }
        }
    }

    async fn finalize_cancelled(&self, task_id: &str) {
        // Abort idempotence: a second finalize finds the record already
        // cancelled and emits nothing
        if let Some(record) = self.store.get(task_id).await {
            if record.status == TaskStatus::Cancelled {
                return;
            }
        }
        self.store
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await;
        self.bus
            .publish(EventKind::TaskCancelled, Some(task_id), None, json!({}))
            .await;
        self.cancellations.release(task_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentHandler, AgentProfile};
    use async_trait::async_trait;

    struct EchoAgent;

    #[async_trait]
    impl AgentHandler for EchoAgent {
        async fn invoke(
            &self,
            input: serde_json::Value,
            _ctx: &RuntimeContext,
        ) -> Result<String> {
            Ok(format!("done: {}", input["query"].as_str().unwrap_or("")))
        }
    }

    /// Fails a configurable number of times, then succeeds.
    struct FlakyAgent {
        failures_left: Arc<AtomicUsize>,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentHandler for FlakyAgent {
        async fn invoke(
            &self,
            _input: serde_json::Value,
            _ctx: &RuntimeContext,
        ) -> Result<String> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(ForgeError::Transient("adapter hiccup".into()))
            } else {
                Ok("recovered".into())
            }
        }
    }

    struct BlockingAgent;

    #[async_trait]
    impl AgentHandler for BlockingAgent {
        async fn invoke(
            &self,
            _input: serde_json::Value,
            ctx: &RuntimeContext,
        ) -> Result<String> {
            ctx.cancel.cancelled().await;
            Err(ForgeError::Cancelled("aborted".into()))
        }
    }

    struct Harness {
        scheduler: Scheduler,
        store: Arc<TaskStore>,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
    }

    async fn harness(config: SchedulerConfig) -> Harness {
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(EventBus::new(100));
        let store = Arc::new(TaskStore::new());
        let kernel = Arc::new(Kernel::new(registry.clone(), bus.clone()));
        let queue = Arc::new(PriorityQueue::new(
            config.base_backoff_ms,
            config.max_backoff_ms,
            100,
        ));
        let cancellations = Arc::new(CancellationRegistry::new());
        let scheduler = Scheduler::new(
            queue,
            registry.clone(),
            kernel,
            store.clone(),
            cancellations,
            bus.clone(),
            config,
        );
        Harness {
            scheduler,
            store,
            bus,
            registry,
        }
    }

    async fn register(harness: &Harness, id: &str, tags: &[&str], handler: Arc<dyn AgentHandler>) {
        harness
            .registry
            .register(
                AgentProfile::new(id, id, tags.iter().map(|t| t.to_string()).collect()),
                handler,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn happy_path_completes_with_output() {
        let h = harness(SchedulerConfig::default()).await;
        register(&h, "echo", &[], Arc::new(EchoAgent)).await;

        let record = h
            .scheduler
            .submit("greet", "say hi", SubmitOptions::default())
            .await
            .unwrap();

        let dispatched = h.scheduler.process_all().await.unwrap();
        assert_eq!(dispatched, 1);
        let done = h
            .scheduler
            .wait_for(&record.id, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("done: say hi"));
        assert!(done.duration_ms.is_some());

        let stats = h.scheduler.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn agent_tag_selection_routes_to_tagged_agent() {
        let h = harness(SchedulerConfig::default()).await;
        register(&h, "researcher", &["research"], Arc::new(EchoAgent)).await;
        register(&h, "builder", &["build"], Arc::new(EchoAgent)).await;

        let record = h
            .scheduler
            .submit(
                "analysis",
                "dig in",
                SubmitOptions {
                    agent_tag: Some("research".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.scheduler.process_next().await.unwrap();
        let done = h
            .scheduler
            .wait_for(&record.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.agent_id.as_deref(), Some("researcher"));
    }

    #[tokio::test]
    async fn transient_failure_retries_with_backoff() {
        let config = SchedulerConfig {
            base_backoff_ms: 20,
            ..Default::default()
        };
        let h = harness(config).await;
        let invocations = Arc::new(AtomicUsize::new(0));
        register(
            &h,
            "flaky",
            &[],
            Arc::new(FlakyAgent {
                failures_left: Arc::new(AtomicUsize::new(1)),
                invocations: invocations.clone(),
            }),
        )
        .await;

        let record = h
            .scheduler
            .submit(
                "flaky-job",
                "try me",
                SubmitOptions {
                    agent_id: Some("flaky".into()),
                    max_retries: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let dispatched_at = Utc::now();
        // First attempt fails, entry re-enters the queue with backoff
        for _ in 0..200 {
            h.scheduler.process_next().await.unwrap();
            if let Some(r) = h.store.get(&record.id).await {
                if r.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let done = h
            .scheduler
            .wait_for(&record.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("recovered"));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        // The retry waited out at least base_backoff * 2
        let elapsed = (done.completed_at.unwrap() - dispatched_at).num_milliseconds();
        assert!(elapsed >= 40, "retry fired too early: {elapsed}ms");

        let steps: Vec<_> = h
            .bus
            .history(&record.id, 50)
            .await
            .into_iter()
            .filter(|e| e.kind == EventKind::TaskStep)
            .filter(|e| e.data["phase"] == "retrying")
            .collect();
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_the_task() {
        let config = SchedulerConfig {
            base_backoff_ms: 5,
            ..Default::default()
        };
        let h = harness(config).await;
        register(
            &h,
            "flaky",
            &[],
            Arc::new(FlakyAgent {
                failures_left: Arc::new(AtomicUsize::new(10)),
                invocations: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await;

        let record = h
            .scheduler
            .submit(
                "doomed",
                "never works",
                SubmitOptions {
                    agent_id: Some("flaky".into()),
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..200 {
            h.scheduler.process_next().await.unwrap();
            if let Some(r) = h.store.get(&record.id).await {
                if r.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let done = h.store.get(&record.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.is_some());
    }

    #[tokio::test]
    async fn concurrency_cap_limits_in_flight_tasks() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let h = harness(config).await;
        register(&h, "blocker", &[], Arc::new(BlockingAgent)).await;

        let first = h
            .scheduler
            .submit("one", "a", SubmitOptions::default())
            .await
            .unwrap();
        h.scheduler
            .submit("two", "b", SubmitOptions::default())
            .await
            .unwrap();

        assert!(h.scheduler.process_next().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Budget saturated: nothing else dispatches
        assert!(!h.scheduler.process_next().await.unwrap());
        assert_eq!(h.scheduler.running_count(), 1);

        h.scheduler.cancel(&first.id).await.unwrap();
        let done = h
            .scheduler
            .wait_for(&first.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn critical_band_preempts_earlier_normals() {
        let config = SchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let h = harness(config).await;
        register(&h, "echo", &[], Arc::new(EchoAgent)).await;

        let mut normal_ids = Vec::new();
        for i in 0..5 {
            let r = h
                .scheduler
                .submit(&format!("n{i}"), format!("normal {i}"), SubmitOptions::default())
                .await
                .unwrap();
            normal_ids.push(r.id);
        }
        let critical = h
            .scheduler
            .submit(
                "urgent",
                "critical work",
                SubmitOptions {
                    priority: Priority::Critical,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut completion_order = Vec::new();
        while completion_order.len() < 6 {
            if h.scheduler.process_next().await.unwrap() {
                // One at a time: wait for the in-flight task before the next
                for _ in 0..100 {
                    if h.scheduler.running_count() == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let all = h
                    .store
                    .query(crate::store::TaskFilter {
                        status: Some(TaskStatus::Completed),
                        sort_by: Some(crate::store::SortBy::CompletedAt),
                        ..Default::default()
                    })
                    .await;
                completion_order = all.into_iter().map(|r| r.id).collect();
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        assert_eq!(completion_order[0], critical.id);
        assert_eq!(&completion_order[1..], normal_ids.as_slice());
    }

    #[tokio::test]
    async fn cancelling_terminal_task_is_a_conflict() {
        let h = harness(SchedulerConfig::default()).await;
        register(&h, "echo", &[], Arc::new(EchoAgent)).await;

        let record = h
            .scheduler
            .submit("quick", "x", SubmitOptions::default())
            .await
            .unwrap();
        h.scheduler.process_next().await.unwrap();
        h.scheduler
            .wait_for(&record.id, Duration::from_secs(2))
            .await
            .unwrap();

        let result = h.scheduler.cancel(&record.id).await;
        assert!(matches!(result, Err(ForgeError::Conflict(_))));
    }
}
