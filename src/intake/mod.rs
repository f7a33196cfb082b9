//! Intake pipeline: the end-to-end request path
//!
//! Validation, agent classification, store registration, cancellation
//! wiring, workflow construction and orchestrator hand-off. The terminal
//! bookkeeping path runs even on abort: the record always reaches a
//! terminal status, the agent slot is returned to idle and the cancellation
//! handle is released.

pub mod validation;

use crate::{
    agents::AgentRegistry,
    cancel::CancellationRegistry,
    constants::{HISTORY_TURNS, HISTORY_TURN_MAX_CHARS},
    dispatch::LoadAwareDispatcher,
    events::{EventBus, EventKind},
    models::{
        AgentDecision, AgentEnvelope, ErrorInfo, FailedLayer, GenerationConfig, SystemMode,
        TaskRecord, TaskStatus,
    },
    orchestrator::{
        ExecuteOptions, NodeStatus, NodeTransition, Orchestrator, WorkflowResult, WorkflowSpec,
        WorkflowStatus,
    },
    planner::{self, PlannerConfig, PlannerMode},
    store::{NewTask, TaskPatch, TaskStore},
    ForgeError, Result,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validation::{canonical_agent_id, RequestValidator};

/// A client submission.
#[derive(Debug, Default, Clone)]
pub struct SubmitRequest {
    pub input: String,
    pub agent: Option<String>,
    pub conversation_id: Option<String>,
    pub generation: Option<GenerationConfig>,
    pub system_mode: Option<SystemMode>,
    pub multi_agent: Option<bool>,
    pub task_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub planner: Option<PlannerConfig>,
}

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub max_input_length: usize,
    pub max_timeout_ms: u64,
    pub history_turns: usize,
    pub history_turn_max_chars: usize,
    pub default_planner: PlannerConfig,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_input_length: crate::constants::MAX_INPUT_LENGTH,
            max_timeout_ms: crate::constants::DEFAULT_MAX_TIMEOUT_MS,
            history_turns: HISTORY_TURNS,
            history_turn_max_chars: HISTORY_TURN_MAX_CHARS,
            default_planner: PlannerConfig::default(),
        }
    }
}

/// Per-task execution parameters kept between `submit` and `execute`.
struct WorkContext {
    agent_id: String,
    planner: PlannerConfig,
    timeout_ms: Option<u64>,
    multi_agent: bool,
}

/// The request pipeline binding every engine component together.
pub struct IntakePipeline {
    store: Arc<TaskStore>,
    bus: Arc<EventBus>,
    cancellations: Arc<CancellationRegistry>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<LoadAwareDispatcher>,
    orchestrator: Arc<Orchestrator>,
    validator: RequestValidator,
    contexts: Mutex<HashMap<String, WorkContext>>,
    workflows: RwLock<HashMap<String, WorkflowSpec>>,
    config: IntakeConfig,
}

impl IntakePipeline {
    pub fn new(
        store: Arc<TaskStore>,
        bus: Arc<EventBus>,
        cancellations: Arc<CancellationRegistry>,
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<LoadAwareDispatcher>,
        orchestrator: Arc<Orchestrator>,
        config: IntakeConfig,
    ) -> Result<Self> {
        let validator = RequestValidator::new(config.max_input_length, config.max_timeout_ms)?;
        Ok(Self {
            store,
            bus,
            cancellations,
            registry,
            dispatcher,
            orchestrator,
            validator,
            contexts: Mutex::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Validate, classify and register a submission. Returns the queued
    /// record; `execute` (or `spawn_execute`) drives it to a terminal state.
    pub async fn submit(&self, req: SubmitRequest) -> Result<TaskRecord> {
        self.validator
            .validate(&req.input, req.agent.as_deref(), req.timeout_ms)?;

        // A reused id referring to a live record is a conflict; every
        // accepted submission runs under a fresh id
        if let Some(reused) = &req.task_id {
            if let Some(existing) = self.store.get(reused).await {
                if !existing.status.is_terminal() {
                    return Err(ForgeError::Conflict(format!(
                        "task {reused} still running"
                    )));
                }
            }
        }
        let task_id = Uuid::new_v4().to_string();

        if self.registry.count().await == 0 {
            return Err(ForgeError::Unavailable("no agents registered".into()));
        }
        let (agent_id, selection_reason, manual_override) = self.classify_agent(&req).await?;

        let planner_config = self.planner_for(&req);
        let multi_agent = planner::should_fan_out(&planner_config, &req.input);

        let decision = AgentDecision {
            candidates: self.registry.all_ids().await,
            scores: None,
            manual_override,
        };
        let record = self
            .store
            .create(
                req.input.clone(),
                NewTask {
                    id: Some(task_id.clone()),
                    agent_id: Some(agent_id.clone()),
                    conversation_id: req.conversation_id.clone(),
                    selection_reason: Some(selection_reason),
                    decision: Some(decision),
                    generation: req.generation.clone(),
                    system_mode: req.system_mode,
                    multi_agent,
                    metadata: HashMap::new(),
                },
            )
            .await;

        self.cancellations.acquire(&task_id).await;
        self.dispatcher.ensure_slot(&agent_id).await;
        self.dispatcher.mark_busy(&agent_id, &task_id).await;
        self.bus
            .publish(
                EventKind::TaskQueued,
                Some(task_id.as_str()),
                Some(agent_id.as_str()),
                json!({ "multi_agent": multi_agent }),
            )
            .await;

        let mut contexts = self.contexts.lock().await;
        contexts.insert(
            task_id.clone(),
            WorkContext {
                agent_id,
                planner: planner_config,
                timeout_ms: req.timeout_ms,
                multi_agent,
            },
        );

        info!("Accepted task {} (multi_agent: {})", task_id, multi_agent);
        Ok(record)
    }

    /// Drive a submitted task to its terminal state and return the final
    /// record.
    pub async fn execute(&self, task_id: &str) -> Result<TaskRecord> {
        let ctx = {
            let mut contexts = self.contexts.lock().await;
            contexts.remove(task_id).ok_or_else(|| {
                ForgeError::NotFound(format!("no pending execution for task {task_id}"))
            })?
        };
        let record = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))?;

        let base_input = self.compose_base_input(&record).await;
        let spec = if ctx.multi_agent {
            WorkflowSpec::Graph {
                nodes: planner::build_graph(&ctx.planner, &record.input),
            }
        } else {
            WorkflowSpec::Atomic {
                agent_id: ctx.agent_id.clone(),
                input: record.input.clone(),
                timeout_ms: ctx.timeout_ms,
            }
        };
        {
            let mut workflows = self.workflows.write().await;
            workflows.insert(task_id.to_string(), spec.clone());
        }

        self.store
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
            )
            .await;

        let token = self.cancellations.acquire(task_id).await;

        // The task budget aborts the workflow through the same signal a
        // user cancel does; the flag tells the terminal paths apart
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = ctx.timeout_ms.map(|timeout| {
            let flag = timed_out.clone();
            let budget_token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout)).await;
                flag.store(true, Ordering::SeqCst);
                budget_token.cancel();
            })
        });

        let options = ExecuteOptions {
            cancel: token,
            on_node_event: Some(self.progress_sink(task_id, &spec)),
        };
        let outcome = self
            .orchestrator
            .execute(task_id, base_input, spec, options)
            .await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let involved = self.involved_agents(task_id).await;
        let final_record = match outcome {
            Ok(result) => {
                self.finalize_result(task_id, &ctx, result, involved).await
            }
            Err(ForgeError::Cancelled(_)) if timed_out.load(Ordering::SeqCst) => {
                let err = ForgeError::Timeout(format!(
                    "task {task_id} exceeded its {}ms budget",
                    ctx.timeout_ms.unwrap_or_default()
                ));
                self.finalize_failed(task_id, &err, involved).await
            }
            Err(ForgeError::Cancelled(reason)) => {
                self.finalize_cancelled(task_id, &reason, involved).await
            }
            Err(err) => self.finalize_failed(task_id, &err, involved).await,
        };

        self.cancellations.release(task_id).await;
        self.dispatcher.mark_idle(&ctx.agent_id).await;

        final_record.ok_or_else(|| ForgeError::NotFound(format!("task {task_id}")))
    }

    /// Submit and await the terminal record in one call.
    pub async fn submit_and_execute(&self, req: SubmitRequest) -> Result<TaskRecord> {
        let record = self.submit(req).await?;
        self.execute(&record.id).await
    }

    /// Submit and drive the execution in the background; returns the queued
    /// record immediately. The HTTP surface responds 202 from this.
    pub async fn spawn_execute(self: Arc<Self>, req: SubmitRequest) -> Result<TaskRecord> {
        let record = self.submit(req).await?;
        let pipeline = self.clone();
        let task_id = record.id.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.execute(&task_id).await {
                warn!("Background execution of {} ended with error: {}", task_id, e);
            }
        });
        Ok(record)
    }

    /// Abort a live task. The in-flight execution observes the signal and
    /// finalizes the record as cancelled.
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
        self.cancellations.abort(task_id, "cancelled by request").await;
        Ok(())
    }

    /// The workflow definition built for a task, for the details surface.
    pub async fn workflow_of(&self, task_id: &str) -> Option<WorkflowSpec> {
        let workflows = self.workflows.read().await;
        workflows.get(task_id).cloned()
    }

    async fn classify_agent(&self, req: &SubmitRequest) -> Result<(String, String, bool)> {
        if let Some(requested) = &req.agent {
            // Validation guarantees the alias is known
            let canonical = canonical_agent_id(requested)
                .ok_or_else(|| ForgeError::Validation(vec![format!("unknown agent {requested}")]))?;
            if self.registry.is_registered(canonical).await {
                return Ok((
                    canonical.to_string(),
                    format!("explicitly requested {requested}"),
                    true,
                ));
            }
            debug!(
                "Requested agent {} not registered, falling back to inference",
                canonical
            );
        }

        let inferred_type = infer_agent_type(&req.input);
        let hint = self.dispatcher.select_for(inferred_type).await;
        let canonical = canonical_agent_id(inferred_type)
            .unwrap_or(planner::WEB_DEV_AGENT_ID);

        let agent_id = if self.registry.is_registered(canonical).await {
            canonical.to_string()
        } else if let Some(hint) = &hint {
            if self.registry.is_registered(&hint.agent_id).await {
                hint.agent_id.clone()
            } else {
                return Err(ForgeError::Unavailable(format!(
                    "no agent for inferred type {inferred_type}"
                )));
            }
        } else {
            return Err(ForgeError::Unavailable(format!(
                "no agent for inferred type {inferred_type}"
            )));
        };

        let wait = hint.map(|h| h.estimated_wait_ms).unwrap_or(0);
        Ok((
            agent_id,
            format!("inferred {inferred_type} intent from input (est. wait {wait}ms)"),
            false,
        ))
    }

    fn planner_for(&self, req: &SubmitRequest) -> PlannerConfig {
        let mut config = req
            .planner
            .clone()
            .unwrap_or_else(|| self.config.default_planner.clone());
        match req.multi_agent {
            Some(true) => {
                config.enabled = true;
                config.mode = PlannerMode::Force;
            }
            Some(false) => config.enabled = false,
            None => {}
        }
        config
    }

    /// Base input shared by every node: task identity, conversation history
    /// and the generation settings.
    async fn compose_base_input(&self, record: &TaskRecord) -> Value {
        let turns = self
            .store
            .conversation_history(&record.conversation_id, self.config.history_turns)
            .await;
        let history: Vec<Value> = turns
            .iter()
            .filter(|t| t.id != record.id)
            .map(|t| {
                json!({
                    "input": truncate_chars(&t.input, self.config.history_turn_max_chars),
                    "output": truncate_chars(
                        t.output.as_deref().unwrap_or_default(),
                        self.config.history_turn_max_chars,
                    ),
                })
            })
            .collect();

        let mut base = json!({
            "task_id": record.id,
            "conversation_id": record.conversation_id,
            "history": history,
            "query": record.input,
            "generation": record.generation,
        });
        if let Some(mode) = record.system_mode {
            base["system_mode"] = serde_json::to_value(mode).unwrap_or(Value::Null);
        }
        base
    }

    /// Progress advances as nodes reach terminal states; the last point is
    /// written by the terminal bookkeeping.
    fn progress_sink(
        &self,
        task_id: &str,
        spec: &WorkflowSpec,
    ) -> Arc<dyn Fn(&crate::orchestrator::NodeEvent) + Send + Sync> {
        let total = match spec {
            WorkflowSpec::Atomic { .. } => 1,
            WorkflowSpec::Graph { nodes } => nodes.len().max(1),
        };
        let done = Arc::new(AtomicUsize::new(0));
        let store = self.store.clone();
        let task_id = task_id.to_string();

        Arc::new(move |event| {
            if matches!(
                event.transition,
                NodeTransition::Succeeded
                    | NodeTransition::Failed
                    | NodeTransition::Skipped
                    | NodeTransition::Cancelled
            ) {
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                let progress = ((finished * 100 / total).min(99)) as u8;
                let store = store.clone();
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    store
                        .update(
                            &task_id,
                            TaskPatch {
                                progress: Some(progress),
                                ..Default::default()
                            },
                        )
                        .await;
                });
            }
        })
    }

    /// Agents that actually executed for this task: every node that left
    /// the pending/skipped states.
    async fn involved_agents(&self, task_id: &str) -> Vec<String> {
        let Some(snapshot) = self.orchestrator.snapshot(task_id).await else {
            return Vec::new();
        };
        let mut agents = Vec::new();
        for node in &snapshot.nodes {
            if !matches!(node.status, NodeStatus::Pending | NodeStatus::Skipped)
                && !agents.contains(&node.agent_id)
            {
                agents.push(node.agent_id.clone());
            }
        }
        agents
    }

    async fn finalize_result(
        &self,
        task_id: &str,
        ctx: &WorkContext,
        result: WorkflowResult,
        involved: Vec<String>,
    ) -> Option<TaskRecord> {
        match result.status {
            WorkflowStatus::Succeeded => {
                let final_node = final_node_id(&self.workflow_of(task_id).await);
                let output = normalize_output(&result, final_node.as_deref());
                let record = self
                    .store
                    .update(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Completed),
                            output: Some(output.clone()),
                            progress: Some(100),
                            involved_agents: Some(involved),
                            ..Default::default()
                        },
                    )
                    .await;
                let elapsed_secs = record
                    .as_ref()
                    .and_then(|r| r.duration_ms)
                    .unwrap_or_default() as f64
                    / 1000.0;
                self.dispatcher
                    .record_completion(&ctx.agent_id, elapsed_secs)
                    .await;
                // Atomic tasks already carried the kernel's completion event
                if ctx.multi_agent {
                    self.bus
                        .publish(
                            EventKind::TaskCompleted,
                            Some(task_id),
                            Some(ctx.agent_id.as_str()),
                            json!({ "output": output, "failures": result.failures.len() }),
                        )
                        .await;
                }
                record
            }
            WorkflowStatus::Failed => {
                let cause = result.failures.first();
                let error = ErrorInfo {
                    message: cause
                        .map(|f| f.error.clone())
                        .unwrap_or_else(|| "workflow failed".to_string()),
                    code: cause.map(|f| f.code.clone()),
                    layer: Some(FailedLayer::Orchestrator),
                    stack: None,
                    hints: Vec::new(),
                };
                let emit = ctx.multi_agent
                    || cause.map(|f| f.code == "timeout").unwrap_or(false);
                self.dispatcher.record_failure(&ctx.agent_id).await;
                let record = self
                    .store
                    .update(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Failed),
                            error: Some(error),
                            involved_agents: Some(involved),
                            ..Default::default()
                        },
                    )
                    .await;
                if emit {
                    self.bus
                        .publish(
                            EventKind::TaskFailed,
                            Some(task_id),
                            Some(ctx.agent_id.as_str()),
                            json!({
                                "error": cause.map(|f| f.error.clone()),
                                "node_id": cause.map(|f| f.node_id.clone()),
                            }),
                        )
                        .await;
                }
                record
            }
            WorkflowStatus::Cancelled => {
                self.finalize_cancelled(task_id, "workflow cancelled", involved)
                    .await
            }
        }
    }

    async fn finalize_failed(
        &self,
        task_id: &str,
        err: &ForgeError,
        involved: Vec<String>,
    ) -> Option<TaskRecord> {
        let record = self
            .store
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    error: Some(ErrorInfo::from_error(err)),
                    involved_agents: Some(involved),
                    ..Default::default()
                },
            )
            .await;
        self.bus
            .publish(
                EventKind::TaskFailed,
                Some(task_id),
                None,
                json!({ "error": err.to_string() }),
            )
            .await;
        record
    }

    async fn finalize_cancelled(
        &self,
        task_id: &str,
        reason: &str,
        involved: Vec<String>,
    ) -> Option<TaskRecord> {
        let record = self
            .store
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    involved_agents: Some(involved),
                    ..Default::default()
                },
            )
            .await;
        self.bus
            .publish(
                EventKind::TaskCancelled,
                Some(task_id),
                None,
                json!({ "reason": reason }),
            )
            .await;
        record
    }
}

/// Keyword inference: research terms first, engine/system terms second,
/// web-dev as the default.
fn infer_agent_type(input: &str) -> &'static str {
    let lowered = input.to_lowercase();
    const RESEARCH: &[&str] = &["research", "analy", "summar", "investig", "benchmark", "compare"];
    const SYSTEM: &[&str] = &["prompt", "orchestrator", "kernel", "system"];
    if RESEARCH.iter().any(|k| lowered.contains(k)) {
        "research"
    } else if SYSTEM.iter().any(|k| lowered.contains(k)) {
        "system"
    } else {
        "web-dev"
    }
}

fn final_node_id(spec: &Option<WorkflowSpec>) -> Option<String> {
    match spec {
        Some(WorkflowSpec::Graph { nodes }) => nodes
            .iter()
            .find(|n| n.role.as_deref() == Some("final"))
            .map(|n| n.id.clone()),
        _ => None,
    }
}

/// Strip the deterministic envelope from the primary output and append the
/// partial-failure block when any allowed failures were absorbed.
fn normalize_output(result: &WorkflowResult, final_node: Option<&str>) -> String {
    let primary = final_node
        .and_then(|id| result.outputs.get(id))
        .or_else(|| {
            result
                .completion_order
                .last()
                .and_then(|id| result.outputs.get(id))
        });
    let mut text = primary.map(|raw| strip_envelope(raw)).unwrap_or_default();

    if !result.failures.is_empty() {
        text.push_str("\n\nPartial failures:");
        for failure in &result.failures {
            text.push_str(&format!("\n- {}: {}", failure.node_id, failure.error));
        }
    }
    text
}

fn strip_envelope(raw: &str) -> String {
    match serde_json::from_str::<AgentEnvelope>(raw) {
        Ok(envelope) => envelope.render(),
        Err(_) => raw.to_string(),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
