//! Kernel: atomic agent invocation and agent lifecycle
//!
//! One `run` call is one execution: verify the agent, record the execution,
//! await the handler racing the task's cancellation signal, restore agent
//! state and emit the task events. The kernel never retries; that is the
//! scheduler's and orchestrator's job.

use crate::{
    agents::{AgentHandler, AgentProfile, AgentRegistry, AgentState, RuntimeContext},
    events::{EventBus, EventKind},
    ForgeError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State of one kernel execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Success,
    Failed,
}

/// Kernel-local record of one invocation. Ephemeral: observability flows
/// through the event bus, not through these records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub state: ExecutionState,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Atomic agent invocation engine.
#[derive(Clone)]
pub struct Kernel {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    executions: Arc<Mutex<HashMap<String, Execution>>>,
    execution_order: Arc<Mutex<Vec<String>>>,
    inboxes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<serde_json::Value>>>>,
}

impl Kernel {
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            executions: Arc::new(Mutex::new(HashMap::new())),
            execution_order: Arc::new(Mutex::new(Vec::new())),
            inboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one agent invocation to completion, racing the cancellation
    /// signal. Returns the execution id and the handler's output.
    pub async fn run(
        &self,
        agent_id: &str,
        input: serde_json::Value,
        ctx: RuntimeContext,
    ) -> Result<(String, String)> {
        let handler = self
            .registry
            .handler(agent_id)
            .await
            .ok_or_else(|| ForgeError::NotFound(format!("agent {agent_id}")))?;

        let execution_id = Uuid::new_v4().to_string();
        let execution = Execution {
            id: execution_id.clone(),
            task_id: ctx.task_id.clone(),
            agent_id: agent_id.to_string(),
            state: ExecutionState::Running,
            input: input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        {
            let mut executions = self.executions.lock().await;
            executions.insert(execution_id.clone(), execution);
            self.execution_order.lock().await.push(execution_id.clone());
        }

        self.registry.set_state(agent_id, AgentState::Running).await;
        self.bus
            .publish(
                EventKind::AgentBusy,
                Some(ctx.task_id.as_str()),
                Some(agent_id),
                json!({ "execution_id": execution_id }),
            )
            .await;
        self.bus
            .publish(
                EventKind::TaskStarted,
                Some(ctx.task_id.as_str()),
                Some(agent_id),
                json!({ "execution_id": execution_id }),
            )
            .await;

        debug!("Execution {} running agent {}", execution_id, agent_id);

        // The cancellation path always wins; a late handler result is dropped
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ForgeError::Cancelled(format!(
                "task {} aborted during agent invocation",
                ctx.task_id
            ))),
            result = handler.invoke(input, &ctx) => result,
        };

        match outcome {
            Ok(output) => {
                self.finish_execution(&execution_id, ExecutionState::Success, Some(output.as_str()), None)
                    .await;
                self.registry.set_state(agent_id, AgentState::Idle).await;
                self.bus
                    .publish(
                        EventKind::AgentIdle,
                        Some(ctx.task_id.as_str()),
                        Some(agent_id),
                        json!({}),
                    )
                    .await;
                self.bus
                    .publish(
                        EventKind::TaskCompleted,
                        Some(ctx.task_id.as_str()),
                        Some(agent_id),
                        json!({ "execution_id": execution_id, "output": output }),
                    )
                    .await;
                info!("Execution {} succeeded on {}", execution_id, agent_id);
                Ok((execution_id, output))
            }
            Err(err @ ForgeError::Cancelled(_)) => {
                self.finish_execution(
                    &execution_id,
                    ExecutionState::Failed,
                    None,
                    Some("cancelled"),
                )
                .await;
                self.registry.set_state(agent_id, AgentState::Idle).await;
                self.bus
                    .publish(
                        EventKind::AgentIdle,
                        Some(ctx.task_id.as_str()),
                        Some(agent_id),
                        json!({}),
                    )
                    .await;
                warn!("Execution {} cancelled on {}", execution_id, agent_id);
                Err(err)
            }
            Err(err) => {
                let message = err.to_string();
                self.finish_execution(
                    &execution_id,
                    ExecutionState::Failed,
                    None,
                    Some(message.as_str()),
                )
                .await;
                self.registry.set_state(agent_id, AgentState::Error).await;
                self.bus
                    .publish(
                        EventKind::TaskFailed,
                        Some(ctx.task_id.as_str()),
                        Some(agent_id),
                        json!({ "execution_id": execution_id, "error": message }),
                    )
                    .await;
                error!("Execution {} failed on {}: {}", execution_id, agent_id, message);
                Err(err)
            }
        }
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        state: ExecutionState,
        output: Option<&str>,
        error: Option<&str>,
    ) {
        let mut executions = self.executions.lock().await;
        if let Some(execution) = executions.get_mut(execution_id) {
            execution.state = state;
            execution.output = output.map(str::to_string);
            execution.error = error.map(str::to_string);
            execution.ended_at = Some(Utc::now());
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        let executions = self.executions.lock().await;
        executions.get(execution_id).cloned()
    }

    /// Most recent executions, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<Execution> {
        let executions = self.executions.lock().await;
        let order = self.execution_order.lock().await;
        let skip = order.len().saturating_sub(limit);
        order
            .iter()
            .skip(skip)
            .filter_map(|id| executions.get(id).cloned())
            .collect()
    }

    pub async fn executions_by_agent(&self, agent_id: &str) -> Vec<Execution> {
        let executions = self.executions.lock().await;
        let order = self.execution_order.lock().await;
        order
            .iter()
            .filter_map(|id| executions.get(id))
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Register an agent with the registry and announce it on the bus.
    pub async fn register(
        &self,
        profile: AgentProfile,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<()> {
        let agent_id = profile.id.clone();
        self.registry.register(profile, handler).await?;
        self.bus
            .publish(EventKind::AgentRegistered, None, Some(agent_id.as_str()), json!({}))
            .await;
        Ok(())
    }

    /// Start an agent: wire its IPC inbox and mark it idle. Idempotent.
    pub async fn start(&self, agent_id: &str) -> Result<()> {
        let handler = self
            .registry
            .handler(agent_id)
            .await
            .ok_or_else(|| ForgeError::NotFound(format!("agent {agent_id}")))?;

        {
            let mut inboxes = self.inboxes.lock().await;
            if inboxes.contains_key(agent_id) {
                return Ok(());
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
            inboxes.insert(agent_id.to_string(), tx);

            let bus = self.bus.clone();
            let inbox_agent = agent_id.to_string();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = handler.on_message(message.clone()).await {
                        warn!("Agent {} inbox handler failed: {}", inbox_agent, e);
                    }
                    bus.publish(
                        EventKind::IpcMessage,
                        None,
                        Some(inbox_agent.as_str()),
                        message,
                    )
                    .await;
                }
                debug!("Inbox closed for agent {}", inbox_agent);
            });
        }

        self.registry.set_state(agent_id, AgentState::Idle).await;
        self.bus
            .publish(EventKind::AgentStarted, None, Some(agent_id), json!({}))
            .await;
        Ok(())
    }

    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        if !self.registry.is_registered(agent_id).await {
            return Err(ForgeError::NotFound(format!("agent {agent_id}")));
        }
        {
            let mut inboxes = self.inboxes.lock().await;
            inboxes.remove(agent_id);
        }
        self.registry.set_state(agent_id, AgentState::Stopped).await;
        self.bus
            .publish(EventKind::AgentStopped, None, Some(agent_id), json!({}))
            .await;
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        let _ = self.stop(agent_id).await;
        self.registry.unregister(agent_id).await
    }

    /// Deliver an IPC message to a started agent's inbox.
    pub async fn send_message(&self, agent_id: &str, payload: serde_json::Value) -> Result<()> {
        let inboxes = self.inboxes.lock().await;
        let tx = inboxes
            .get(agent_id)
            .ok_or_else(|| ForgeError::NotFound(format!("agent {agent_id} not started")))?;
        tx.send(payload)
            .map_err(|_| ForgeError::Agent {
                message: format!("agent {agent_id} inbox closed"),
            })
    }
}
