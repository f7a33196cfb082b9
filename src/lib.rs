//! # Taskforge
//!
//! Taskforge is a multi-agent task orchestration runtime: clients submit
//! free-text work items, the runtime classifies each item to an agent,
//! schedules it on a suitable worker, runs it as an atomic invocation or a
//! DAG of cooperating agent steps, persists the full execution record and
//! exposes live progress over an event stream.
//!
//! ## Architecture
//!
//! The engine consists of:
//! - **Intake Pipeline**: validation, agent classification and registration
//! - **Orchestrator**: DAG workflow execution with per-node policies
//! - **Kernel**: atomic agent invocation and agent lifecycle
//! - **Scheduler**: priority dispatch with retry backoff and a concurrency cap
//! - **Task Store**: durable records, retry chains, conversations, leases
//! - **Event Bus / Cancellation Registry**: observability and abort wiring
//!
//! Concrete agent implementations, model providers and tools live behind
//! the `AgentHandler` seam; the core never depends on them.

/// Agent model and registry
pub mod agents;
/// HTTP API server and endpoints
pub mod api;
/// Cancellation registry and abort propagation
pub mod cancel;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Load-aware dispatch hints
pub mod dispatch;
/// Error types and handling
pub mod error;
/// Typed event bus
pub mod events;
/// Intake pipeline
pub mod intake;
/// Atomic agent invocation
pub mod kernel;
/// Core data models
pub mod models;
/// DAG workflow execution
pub mod orchestrator;
/// Multi-agent planning
pub mod planner;
/// Priority queue
pub mod queue;
/// Priority dispatch engine
pub mod scheduler;
/// Durable task store
pub mod store;

#[cfg(test)]
mod tests;

pub use error::{ForgeError, Result};
