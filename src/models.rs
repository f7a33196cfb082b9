use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

/// Durable record of one submitted task
///
/// Task records are the fundamental unit of work in Taskforge. The task
/// store exclusively owns them; every other component holds the id only.
/// Retry lineage is kept bidirectional: `original_task_id` points up,
/// `retries` points down, and the two must stay inverses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub input: String,
    pub output: Option<String>,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub agent_version: Option<String>,
    pub selection_reason: Option<String>,
    pub decision: Option<AgentDecision>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<ErrorInfo>,
    pub is_retry: bool,
    pub original_task_id: Option<String>,
    pub retry_count: u32,
    pub retries: Vec<String>,
    pub involved_agents: Vec<String>,
    pub conversation_id: String,
    pub progress: u8,
    pub generation: GenerationConfig,
    pub system_mode: Option<SystemMode>,
    pub multi_agent: bool,
    pub lease: Option<Lease>,
    pub metadata: HashMap<String, String>,
}

/// Current status of a task in the processing pipeline
///
/// Transitions are monotone: `pending -> in_progress -> terminal`. The
/// store rejects anything that would move a record backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Task priority bands
///
/// Higher bands are always drained before lower ones; within a band the
/// queue is FIFO.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Generation mode selecting sampling behavior for model-backed agents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Creative,
    Deterministic,
}

/// Per-task generation configuration forwarded to agent handlers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    pub mode: GenerationMode,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::Creative,
            temperature: 0.7,
            max_tokens: 4096,
            seed: None,
        }
    }
}

/// System operating mode attached to a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Assist,
    Power,
    Autonomous,
}

/// The layer a failure is attributed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailedLayer {
    Intake,
    Orchestrator,
    Scheduler,
    Kernel,
    Agent,
    Model,
    Tool,
    Store,
}

/// Stored error detail for a failed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<FailedLayer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            layer: None,
            stack: None,
            hints: Vec::new(),
        }
    }

    pub fn from_error(err: &crate::ForgeError) -> Self {
        Self {
            message: err.to_string(),
            code: Some(err.code().to_string()),
            layer: Some(err.layer()),
            stack: None,
            hints: Vec::new(),
        }
    }
}

/// How an agent was chosen for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<HashMap<String, f64>>,
    pub manual_override: bool,
}

/// A worker's time-bounded claim on a task id
///
/// Either absent or fully populated; the store enforces compare-and-set
/// semantics so two workers never hold an unexpired lease together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub last_claimed_at: DateTime<Utc>,
    pub claim_count: u32,
}

/// Result payload returned by any agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentResult {
    Text { content: String },
    Json { content: serde_json::Value },
    Code { files: Vec<CodeFile> },
    Error { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeFile {
    pub path: String,
    pub content: String,
}

/// Deterministic envelope wrapping every agent result on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub ok: bool,
    pub agent: String,
    pub result: AgentResult,
}

impl AgentEnvelope {
    /// Render the inner result as display text, by result type.
    pub fn render(&self) -> String {
        match &self.result {
            AgentResult::Text { content } => content.clone(),
            AgentResult::Json { content } => {
                serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string())
            }
            AgentResult::Code { files } => files
                .iter()
                .map(|f| format!("// {}\n{}", f.path, f.content))
                .collect::<Vec<_>>()
                .join("\n\n"),
            AgentResult::Error { reason } => format!("Error: {reason}"),
        }
    }
}

/// Queued-payload wire shape handed between workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPayload {
    pub task_id: String,
    pub input: String,
    pub selected_agent_id: Option<String>,
    pub registered_task_id: String,
    pub agent_type: String,
    pub multi_agent_config: Option<serde_json::Value>,
    pub priority: i64,
    pub meta: HashMap<String, String>,
}

impl TaskRecord {
    /// Creates a fresh pending record with start time set.
    pub fn new(id: Option<String>, input: String) -> Self {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            conversation_id: id.clone(),
            id,
            input,
            output: None,
            status: TaskStatus::Pending,
            agent_id: None,
            agent_version: None,
            selection_reason: None,
            decision: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
            is_retry: false,
            original_task_id: None,
            retry_count: 0,
            retries: Vec::new(),
            involved_agents: Vec::new(),
            progress: 0,
            generation: GenerationConfig::default(),
            system_mode: None,
            multi_agent: false,
            lease: None,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_band_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn agent_result_envelope_roundtrip() {
        let envelope = AgentEnvelope {
            ok: true,
            agent: "research-agent".to_string(),
            result: AgentResult::Text {
                content: "summary of findings".to_string(),
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"text\""));

        let back: AgentEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.render(), "summary of findings");
    }

    #[test]
    fn code_result_renders_file_paths() {
        let envelope = AgentEnvelope {
            ok: true,
            agent: "web-dev-agent".to_string(),
            result: AgentResult::Code {
                files: vec![CodeFile {
                    path: "src/lib.rs".to_string(),
                    content: "pub fn add() {}".to_string(),
                }],
            },
        };
        let rendered = envelope.render();
        assert!(rendered.contains("// src/lib.rs"));
        assert!(rendered.contains("pub fn add()"));
    }

    #[test]
    fn new_record_defaults_conversation_to_own_id() {
        let record = TaskRecord::new(None, "do the thing".to_string());
        assert_eq!(record.conversation_id, record.id);
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(!record.is_retry);
    }
}
