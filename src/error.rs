use crate::models::FailedLayer;
use thiserror::Error;

/// Convenience type alias for Results with ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for Taskforge
///
/// Variants are grouped by kind rather than by origin: the scheduler and
/// orchestrator decide retry behavior from the kind alone.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Non-retryable failure: {0}")]
    NonRetryable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("No suitable agent available: {0}")]
    Unavailable(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ForgeError {
    /// Whether the scheduler/orchestrator retry policy applies to this error.
    ///
    /// Agent and task execution failures count as transient; cancellation,
    /// validation and conflict errors are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::Transient(_)
                | ForgeError::Timeout(_)
                | ForgeError::Agent { .. }
                | ForgeError::TaskExecution { .. }
        )
    }

    /// The layer a failure is attributed to in stored error info.
    pub fn layer(&self) -> FailedLayer {
        match self {
            ForgeError::Validation(_) | ForgeError::Conflict(_) => FailedLayer::Intake,
            ForgeError::Workflow(_) => FailedLayer::Orchestrator,
            ForgeError::Unavailable(_) => FailedLayer::Scheduler,
            ForgeError::NotFound(_) | ForgeError::Timeout(_) => FailedLayer::Kernel,
            ForgeError::Agent { .. } | ForgeError::TaskExecution { .. } => FailedLayer::Agent,
            ForgeError::Transient(_) | ForgeError::NonRetryable(_) => FailedLayer::Model,
            _ => FailedLayer::Kernel,
        }
    }

    /// Short machine-readable code stored alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::Validation(_) => "validation",
            ForgeError::NotFound(_) => "not_found",
            ForgeError::Conflict(_) => "conflict",
            ForgeError::Transient(_) => "transient",
            ForgeError::NonRetryable(_) => "non_retryable",
            ForgeError::Timeout(_) => "timeout",
            ForgeError::Cancelled(_) => "cancelled",
            ForgeError::Unavailable(_) => "unavailable",
            ForgeError::Agent { .. } => "agent",
            ForgeError::TaskExecution { .. } => "task_execution",
            ForgeError::Workflow(_) => "workflow",
            ForgeError::Configuration(_) => "configuration",
            ForgeError::Serialization(_) => "serialization",
            ForgeError::Internal(_) => "internal",
        }
    }
}
