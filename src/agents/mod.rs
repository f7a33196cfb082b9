//! Agent model: the handler seam and the registry that owns agent identity

pub mod registry;

pub use registry::AgentRegistry;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to an agent handler.
///
/// Handlers are cooperative: they must honor `cancel` and yield at their
/// model/tool suspension points.
#[derive(Clone)]
pub struct RuntimeContext {
    pub task_id: String,
    pub cancel: CancellationToken,
}

/// The seam between the engine and concrete agent implementations.
///
/// Model providers, tools and sandboxes live behind this trait; the core
/// only ever sees input text in, output text out.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Execute one invocation. The input is the composed base-input object
    /// serialized as JSON; the output is whatever the agent produces,
    /// conventionally a serialized result envelope.
    async fn invoke(&self, input: serde_json::Value, ctx: &RuntimeContext) -> Result<String>;

    /// Receive an out-of-band IPC message. Default: ignore.
    async fn on_message(&self, _message: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Agent lifecycle state tracked by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Uninitialized,
    Idle,
    Running,
    Stopped,
    Error,
}

/// Registry-owned identity and capability record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags,
            state: AgentState::Uninitialized,
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = Some(permissions);
        self
    }
}
