//! Orchestrator: atomic and DAG workflow execution
//!
//! Walks the dependency graph, fans ready nodes out in parallel, and owns
//! every piece of workflow execution state for its active workflows. A node
//! starts strictly after all of its dependencies are terminal (succeeded,
//! or failed with `allow_failure`). Cancellation propagates through child
//! tokens: workflow -> node -> agent handler.

pub mod graph;

pub use graph::{
    NodeEvent, NodeFailure, NodeSpec, NodeStatus, NodeTransition, NodeView, WorkflowResult,
    WorkflowSnapshot, WorkflowSpec, WorkflowStatus,
};

use crate::{
    agents::RuntimeContext,
    constants::{DEFAULT_BASE_BACKOFF_MS, DEFAULT_NODE_TIMEOUT_MS},
    events::{EventBus, EventKind},
    kernel::Kernel,
    ForgeError, Result,
};
use graph::validate_nodes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub node_timeout_ms: u64,
    pub base_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
        }
    }
}

type NodeEventSink = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// Per-execution options: the abort signal and an optional node-event sink.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub cancel: CancellationToken,
    pub on_node_event: Option<NodeEventSink>,
}

struct NodeOutcome {
    node_id: String,
    result: Result<String>,
}

/// Emits typed node events to the sink and trace steps to the bus.
#[derive(Clone)]
struct NodeEmitter {
    bus: Arc<EventBus>,
    sink: Option<NodeEventSink>,
    task_id: String,
}

impl NodeEmitter {
    async fn emit(&self, event: NodeEvent) {
        if let Some(sink) = &self.sink {
            sink(&event);
        }
        self.bus
            .publish(
                EventKind::TaskStep,
                Some(self.task_id.as_str()),
                None,
                json!({
                    "step": event.trace(),
                    "node_id": event.node_id,
                    "transition": event.transition,
                    "attempt": event.attempt,
                    "error": event.error,
                }),
            )
            .await;
    }
}

/// DAG workflow engine.
#[derive(Clone)]
pub struct Orchestrator {
    kernel: Arc<Kernel>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    snapshots: Arc<RwLock<HashMap<String, WorkflowSnapshot>>>,
}

impl Orchestrator {
    pub fn new(kernel: Arc<Kernel>, bus: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        Self {
            kernel,
            bus,
            config,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Execute a workflow to a terminal state.
    ///
    /// A succeeded or failed workflow returns `Ok` with the collected
    /// outputs and failures; an aborted workflow surfaces
    /// `ForgeError::Cancelled` after cancelling every live node.
    pub async fn execute(
        &self,
        task_id: &str,
        base_input: Value,
        spec: WorkflowSpec,
        opts: ExecuteOptions,
    ) -> Result<WorkflowResult> {
        let nodes = match spec {
            WorkflowSpec::Atomic {
                agent_id,
                input,
                timeout_ms,
            } => vec![NodeSpec {
                id: "main".to_string(),
                agent_id,
                input,
                role: None,
                depends_on: Vec::new(),
                allow_failure: false,
                retries: 0,
                timeout_ms,
            }],
            WorkflowSpec::Graph { nodes } => nodes,
        };
        validate_nodes(&nodes)?;

        self.bus
            .publish(
                EventKind::TaskStep,
                Some(task_id),
                None,
                json!({ "step": "orchestrator.execute-workflow", "nodes": nodes.len() }),
            )
            .await;
        info!("Executing workflow for task {} ({} nodes)", task_id, nodes.len());

        let result = self.run_graph(task_id, base_input, nodes, opts).await;

        match &result {
            Ok(outcome) => {
                self.bus
                    .publish(
                        EventKind::TaskStep,
                        Some(task_id),
                        None,
                        json!({
                            "step": "orchestrator.execute-workflow",
                            "status": outcome.status,
                        }),
                    )
                    .await;
            }
            Err(err) => {
                debug!("Workflow for task {} ended with error: {}", task_id, err);
            }
        }
        result
    }

    /// Last known node states for a workflow, kept after completion for the
    /// details surface.
    pub async fn snapshot(&self, task_id: &str) -> Option<WorkflowSnapshot> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(task_id).cloned()
    }

    pub async fn forget(&self, task_id: &str) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(task_id);
    }

    async fn run_graph(
        &self,
        task_id: &str,
        base_input: Value,
        nodes: Vec<NodeSpec>,
        opts: ExecuteOptions,
    ) -> Result<WorkflowResult> {
        let node_map: HashMap<String, NodeSpec> =
            nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();
        let mut states: HashMap<String, NodeStatus> = nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        let mut node_tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut completion_order: Vec<String> = Vec::new();
        let mut failures: Vec<NodeFailure> = Vec::new();
        let mut running = 0usize;

        let emitter = NodeEmitter {
            bus: self.bus.clone(),
            sink: opts.on_node_event.clone(),
            task_id: task_id.to_string(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeOutcome>();

        self.store_snapshot(task_id, &nodes, &states).await;

        loop {
            if opts.cancel.is_cancelled() {
                return self
                    .finish_cancelled(task_id, &nodes, &mut states, &mut rx, running, &emitter)
                    .await;
            }

            // A node is ready when every dependency is succeeded or
            // failed-with-allow
            let ready: Vec<NodeSpec> = nodes
                .iter()
                .filter(|n| states.get(&n.id) == Some(&NodeStatus::Pending))
                .filter(|n| {
                    n.depends_on.iter().all(|dep| {
                        match states.get(dep) {
                            Some(NodeStatus::Succeeded) => true,
                            Some(NodeStatus::Failed) => node_map
                                .get(dep)
                                .map(|d| d.allow_failure)
                                .unwrap_or(false),
                            _ => false,
                        }
                    })
                })
                .cloned()
                .collect();

            for node in ready {
                states.insert(node.id.clone(), NodeStatus::Running);
                running += 1;
                emitter
                    .emit(NodeEvent {
                        node_id: node.id.clone(),
                        transition: NodeTransition::Running,
                        attempt: 1,
                        error: None,
                    })
                    .await;

                let node_token = opts.cancel.child_token();
                node_tokens.insert(node.id.clone(), node_token.clone());
                let effective_input = effective_node_input(&base_input, &node, &outputs);

                self.spawn_node(
                    task_id,
                    node,
                    effective_input,
                    node_token,
                    emitter.clone(),
                    tx.clone(),
                );
            }
            self.store_snapshot(task_id, &nodes, &states).await;

            if running == 0 {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = opts.cancel.cancelled() => {
                    return self
                        .finish_cancelled(task_id, &nodes, &mut states, &mut rx, running, &emitter)
                        .await;
                }
                received = rx.recv() => match received {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            running -= 1;

            match outcome.result {
                Ok(output) => {
                    states.insert(outcome.node_id.clone(), NodeStatus::Succeeded);
                    outputs.insert(outcome.node_id.clone(), output);
                    completion_order.push(outcome.node_id.clone());
                    emitter
                        .emit(NodeEvent {
                            node_id: outcome.node_id,
                            transition: NodeTransition::Succeeded,
                            attempt: 1,
                            error: None,
                        })
                        .await;
                }
                Err(ForgeError::Cancelled(_)) => {
                    states.insert(outcome.node_id.clone(), NodeStatus::Cancelled);
                    return self
                        .finish_cancelled(task_id, &nodes, &mut states, &mut rx, running, &emitter)
                        .await;
                }
                Err(err) => {
                    let message = err.to_string();
                    let code = err.code().to_string();
                    states.insert(outcome.node_id.clone(), NodeStatus::Failed);
                    emitter
                        .emit(NodeEvent {
                            node_id: outcome.node_id.clone(),
                            transition: NodeTransition::Failed,
                            attempt: 1,
                            error: Some(message.clone()),
                        })
                        .await;

                    let allowed = node_map
                        .get(&outcome.node_id)
                        .map(|n| n.allow_failure)
                        .unwrap_or(false);
                    if allowed {
                        warn!(
                            "Node {} failed (allowed), workflow continues: {}",
                            outcome.node_id, message
                        );
                        failures.push(NodeFailure {
                            node_id: outcome.node_id,
                            error: message,
                            code,
                        });
                    } else {
                        failures.insert(
                            0,
                            NodeFailure {
                                node_id: outcome.node_id.clone(),
                                error: message,
                                code,
                            },
                        );
                        return self
                            .propagate_failure(
                                task_id,
                                &nodes,
                                &node_tokens,
                                &mut states,
                                &mut rx,
                                running,
                                &emitter,
                                outputs,
                                completion_order,
                                failures,
                            )
                            .await;
                    }
                }
            }
            self.store_snapshot(task_id, &nodes, &states).await;
        }

        let status = if nodes.iter().all(|n| {
            states.get(&n.id) == Some(&NodeStatus::Succeeded)
                || (n.allow_failure && states.get(&n.id) == Some(&NodeStatus::Failed))
        }) {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        };
        self.store_snapshot(task_id, &nodes, &states).await;

        Ok(WorkflowResult {
            status,
            outputs,
            completion_order,
            failures,
        })
    }

    fn spawn_node(
        &self,
        task_id: &str,
        node: NodeSpec,
        input: Value,
        token: CancellationToken,
        emitter: NodeEmitter,
        tx: mpsc::UnboundedSender<NodeOutcome>,
    ) {
        let kernel = self.kernel.clone();
        let task_id = task_id.to_string();
        let node_timeout = node.timeout_ms.unwrap_or(self.config.node_timeout_ms);
        let base_backoff = self.config.base_backoff_ms;

        tokio::spawn(async move {
            let mut attempt = 0u32;
            let result = loop {
                // The attempt signal is derived from the node timeout plus
                // the workflow signal: either cancels the kernel run cleanly
                let attempt_token = token.child_token();
                let watchdog = tokio::spawn({
                    let timeout_token = attempt_token.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(node_timeout)).await;
                        timeout_token.cancel();
                    }
                });
                let ctx = RuntimeContext {
                    task_id: task_id.clone(),
                    cancel: attempt_token,
                };
                let attempt_result = kernel
                    .run(&node.agent_id, input.clone(), ctx)
                    .await
                    .map(|(_, output)| output);
                watchdog.abort();

                let attempt_result = match attempt_result {
                    // An abort with the workflow signal untouched is the
                    // node's own timeout firing
                    Err(ForgeError::Cancelled(_)) if !token.is_cancelled() => {
                        Err(ForgeError::Timeout(format!(
                            "node {} exceeded {}ms",
                            node.id, node_timeout
                        )))
                    }
                    other => other,
                };

                match attempt_result {
                    Ok(output) => break Ok(output),
                    Err(err @ ForgeError::Cancelled(_)) => break Err(err),
                    Err(err) if attempt < node.retries && err.is_retryable() => {
                        attempt += 1;
                        emitter
                            .emit(NodeEvent {
                                node_id: node.id.clone(),
                                transition: NodeTransition::Retrying,
                                attempt,
                                error: Some(err.to_string()),
                            })
                            .await;
                        let delay = base_backoff.saturating_mul(1 << attempt);
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break Err(ForgeError::Cancelled(format!(
                                "node {} aborted during backoff", node.id
                            ))),
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                    }
                    Err(err) => break Err(err),
                }
            };

            let _ = tx.send(NodeOutcome {
                node_id: node.id,
                result,
            });
        });
    }

    /// Hard failure: abort every running node, skip everything still
    /// pending, and finalize the workflow as failed.
    #[allow(clippy::too_many_arguments)]
    async fn propagate_failure(
        &self,
        task_id: &str,
        nodes: &[NodeSpec],
        node_tokens: &HashMap<String, CancellationToken>,
        states: &mut HashMap<String, NodeStatus>,
        rx: &mut mpsc::UnboundedReceiver<NodeOutcome>,
        mut running: usize,
        emitter: &NodeEmitter,
        mut outputs: HashMap<String, String>,
        mut completion_order: Vec<String>,
        failures: Vec<NodeFailure>,
    ) -> Result<WorkflowResult> {
        for (node_id, status) in states.iter() {
            if *status == NodeStatus::Running {
                if let Some(token) = node_tokens.get(node_id) {
                    token.cancel();
                }
            }
        }

        // Drain aborted nodes; one that already produced a result before the
        // abort won genuinely finished, so its output is kept
        while running > 0 {
            let Some(outcome) = rx.recv().await else { break };
            running -= 1;
            match outcome.result {
                Ok(output) => {
                    states.insert(outcome.node_id.clone(), NodeStatus::Succeeded);
                    outputs.insert(outcome.node_id.clone(), output);
                    completion_order.push(outcome.node_id);
                }
                Err(_) => {
                    states.insert(outcome.node_id.clone(), NodeStatus::Cancelled);
                    emitter
                        .emit(NodeEvent {
                            node_id: outcome.node_id,
                            transition: NodeTransition::Cancelled,
                            attempt: 1,
                            error: None,
                        })
                        .await;
                }
            }
        }

        for node in nodes {
            if states.get(&node.id) == Some(&NodeStatus::Pending) {
                states.insert(node.id.clone(), NodeStatus::Skipped);
                emitter
                    .emit(NodeEvent {
                        node_id: node.id.clone(),
                        transition: NodeTransition::Skipped,
                        attempt: 0,
                        error: None,
                    })
                    .await;
            }
        }
        self.store_snapshot(task_id, nodes, states).await;

        Ok(WorkflowResult {
            status: WorkflowStatus::Failed,
            outputs,
            completion_order,
            failures,
        })
    }

    /// Workflow abort: running nodes are already children of the workflow
    /// token; mark them and everything pending as cancelled, then surface
    /// the abort. Cancellation wins over any other terminal cause.
    async fn finish_cancelled(
        &self,
        task_id: &str,
        nodes: &[NodeSpec],
        states: &mut HashMap<String, NodeStatus>,
        rx: &mut mpsc::UnboundedReceiver<NodeOutcome>,
        mut running: usize,
        emitter: &NodeEmitter,
    ) -> Result<WorkflowResult> {
        while running > 0 {
            let Some(outcome) = rx.recv().await else { break };
            running -= 1;
            states.insert(outcome.node_id.clone(), NodeStatus::Cancelled);
            emitter
                .emit(NodeEvent {
                    node_id: outcome.node_id,
                    transition: NodeTransition::Cancelled,
                    attempt: 1,
                    error: None,
                })
                .await;
        }

        for node in nodes {
            if matches!(
                states.get(&node.id),
                Some(NodeStatus::Pending) | Some(NodeStatus::Running)
            ) {
                states.insert(node.id.clone(), NodeStatus::Cancelled);
                emitter
                    .emit(NodeEvent {
                        node_id: node.id.clone(),
                        transition: NodeTransition::Cancelled,
                        attempt: 0,
                        error: None,
                    })
                    .await;
            }
        }
        self.store_snapshot(task_id, nodes, states).await;

        warn!("Workflow for task {} cancelled", task_id);
        Err(ForgeError::Cancelled(format!("workflow {task_id} aborted")))
    }

    async fn store_snapshot(
        &self,
        task_id: &str,
        nodes: &[NodeSpec],
        states: &HashMap<String, NodeStatus>,
    ) {
        let snapshot = WorkflowSnapshot {
            nodes: nodes
                .iter()
                .map(|n| NodeView {
                    id: n.id.clone(),
                    agent_id: n.agent_id.clone(),
                    depends_on: n.depends_on.clone(),
                    status: *states.get(&n.id).unwrap_or(&NodeStatus::Pending),
                    role: n.role.clone(),
                })
                .collect(),
        };
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(task_id.to_string(), snapshot);
    }
}

/// Merge the workflow base input with the node's objective, role and the
/// outputs of its dependencies.
fn effective_node_input(
    base_input: &Value,
    node: &NodeSpec,
    outputs: &HashMap<String, String>,
) -> Value {
    let mut merged = match base_input {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            if !other.is_null() {
                map.insert("base".to_string(), other.clone());
            }
            map
        }
    };

    merged.insert("objective".to_string(), Value::String(node.input.clone()));
    if let Some(role) = &node.role {
        merged.insert("role".to_string(), Value::String(role.clone()));
    }
    let dep_outputs: serde_json::Map<String, Value> = node
        .depends_on
        .iter()
        .filter_map(|dep| {
            outputs
                .get(dep)
                .map(|o| (dep.clone(), Value::String(o.clone())))
        })
        .collect();
    merged.insert("dep_outputs".to_string(), Value::Object(dep_outputs));

    Value::Object(merged)
}

#[cfg(test)]
mod tests;
