//! Workflow and node definitions, plus DAG validation

use crate::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// A workflow is either one atomic invocation or a DAG of cooperating steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkflowSpec {
    Atomic {
        agent_id: String,
        input: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Graph { nodes: Vec<NodeSpec> },
}

/// One step in a DAG workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub agent_id: String,
    /// The node's objective, merged into its effective input.
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Per-node execution state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

/// Typed node transition carried by node events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeTransition {
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for NodeTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeTransition::Running => "running",
            NodeTransition::Retrying => "retrying",
            NodeTransition::Succeeded => "succeeded",
            NodeTransition::Failed => "failed",
            NodeTransition::Skipped => "skipped",
            NodeTransition::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A node state change, with a trace string for display surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: String,
    pub transition: NodeTransition,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeEvent {
    pub fn trace(&self) -> String {
        format!("graph.node.{}.{}", self.node_id, self.transition)
    }
}

/// Terminal status of one workflow execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: String,
    /// Machine-readable error kind (`timeout`, `agent`, ...).
    pub code: String,
}

/// Collected outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    /// Node outputs keyed by node id.
    pub outputs: HashMap<String, String>,
    /// Node ids in the order they finished successfully.
    pub completion_order: Vec<String>,
    /// Failures absorbed by `allow_failure` nodes, or the propagating
    /// failure first when the workflow failed.
    pub failures: Vec<NodeFailure>,
}

/// Read-only view of a workflow's nodes for the details surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub id: String,
    pub agent_id: String,
    pub depends_on: Vec<String>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Validate a node set: unique ids, resolvable dependencies, acyclicity,
/// and a `final` aggregator (when present) depending on every other node.
pub fn validate_nodes(nodes: &[NodeSpec]) -> Result<()> {
    if nodes.is_empty() {
        return Err(ForgeError::Workflow("graph has no nodes".into()));
    }

    let mut ids = HashSet::new();
    for node in nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ForgeError::Workflow(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
    }

    for node in nodes {
        for dep in &node.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ForgeError::Workflow(format!(
                    "node {} depends on unknown node {}",
                    node.id, dep
                )));
            }
            if dep == &node.id {
                return Err(ForgeError::Workflow(format!(
                    "node {} depends on itself",
                    node.id
                )));
            }
        }
    }

    // Kahn's algorithm: every node must be reachable through the topological
    // order, otherwise a cycle exists.
    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        for dep in &node.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                let degree = in_degree.get_mut(child).ok_or_else(|| {
                    ForgeError::Workflow(format!("unknown node {child} in edge set"))
                })?;
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }
    if visited != nodes.len() {
        return Err(ForgeError::Workflow("graph contains a cycle".into()));
    }

    if let Some(final_node) = nodes.iter().find(|n| n.role.as_deref() == Some("final")) {
        let deps: HashSet<&str> = final_node.depends_on.iter().map(String::as_str).collect();
        for node in nodes {
            if node.id != final_node.id && !deps.contains(node.id.as_str()) {
                return Err(ForgeError::Workflow(format!(
                    "final node {} must depend on node {}",
                    final_node.id, node.id
                )));
            }
        }
    }

    Ok(())
}
