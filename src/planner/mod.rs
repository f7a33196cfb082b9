//! Multi-agent planner: intent classification and rule-based DAG construction
//!
//! Given raw input text and a planner configuration, decide whether a task
//! fans out to multiple agents and, when it does, build the node graph.

use crate::orchestrator::NodeSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const RESEARCH_AGENT_ID: &str = "research-agent";
pub const WEB_DEV_AGENT_ID: &str = "web-dev-agent";
pub const SYSTEM_AGENT_ID: &str = "system-agent";

const RESEARCH_KEYWORDS: &[&str] = &[
    "research", "analy", "summar", "investig", "benchmark", "compare",
];
const BUILD_KEYWORDS: &[&str] = &[
    "build", "implement", "code", "create", "develop", "ui", "frontend", "backend", "api",
    "design",
];
const REVIEW_KEYWORDS: &[&str] = &[
    "review", "audit", "security", "test", "validate", "check", "verify",
];

/// How the planner decides between single- and multi-agent execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlannerMode {
    Auto,
    Force,
}

/// Which planner builds the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    Rule,
    None,
}

/// What a node failure does to the rest of the workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    Continue,
    Stop,
}

/// Failure policy mapped onto nodes at graph-construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub default_action: FailureAction,
    #[serde(default)]
    pub per_node: HashMap<String, FailureAction>,
    #[serde(default)]
    pub retries: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            default_action: FailureAction::Stop,
            per_node: HashMap::new(),
            retries: 0,
        }
    }
}

/// Planner configuration carried by a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub enabled: bool,
    pub mode: PlannerMode,
    pub planner: PlannerKind,
    /// Explicit graph supplied by the caller, bypassing rule construction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<Vec<NodeSpec>>,
    pub failure_policy: FailurePolicy,
    pub node_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_agent_id: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PlannerMode::Auto,
            planner: PlannerKind::Rule,
            graph: None,
            failure_policy: FailurePolicy::default(),
            node_timeout_ms: crate::constants::DEFAULT_NODE_TIMEOUT_MS,
            final_agent_id: None,
        }
    }
}

/// Independent intent signals detected in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentSignals {
    pub research: bool,
    pub build: bool,
    pub review: bool,
}

impl IntentSignals {
    pub fn matched(&self) -> usize {
        [self.research, self.build, self.review]
            .iter()
            .filter(|m| **m)
            .count()
    }
}

/// Case-insensitive keyword classification of the three intent signals.
pub fn classify_intents(input: &str) -> IntentSignals {
    let lowered = input.to_lowercase();
    let any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
    IntentSignals {
        research: any(RESEARCH_KEYWORDS),
        build: any(BUILD_KEYWORDS),
        review: any(REVIEW_KEYWORDS),
    }
}

/// Whether this submission fans out to multiple agents.
pub fn should_fan_out(config: &PlannerConfig, input: &str) -> bool {
    if !config.enabled {
        return false;
    }
    match config.mode {
        PlannerMode::Force => true,
        PlannerMode::Auto => classify_intents(input).matched() >= 2,
    }
}

/// Build the workflow node set for a multi-agent submission.
///
/// An explicit graph wins; otherwise the rule planner derives nodes from the
/// detected intents: research and build run in parallel when both are
/// present, review depends on everything before it, and an optional final
/// aggregator depends on every other node.
pub fn build_graph(config: &PlannerConfig, input: &str) -> Vec<NodeSpec> {
    let mut nodes = match (&config.graph, config.planner) {
        (Some(graph), _) => graph.clone(),
        (None, PlannerKind::None) => Vec::new(),
        (None, PlannerKind::Rule) => rule_nodes(config, input),
    };
    if nodes.is_empty() {
        nodes = vec![make_node(config, "build", WEB_DEV_AGENT_ID, input, &[])];
    }

    if let Some(final_agent) = &config.final_agent_id {
        if !nodes.iter().any(|n| n.role.as_deref() == Some("final")) {
            let all_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
            let mut aggregator = make_node(
                config,
                "final",
                final_agent,
                input,
                &all_ids.iter().map(String::as_str).collect::<Vec<_>>(),
            );
            aggregator.role = Some("final".to_string());
            nodes.push(aggregator);
        }
    }

    debug!("Planner built {} nodes", nodes.len());
    nodes
}

fn rule_nodes(config: &PlannerConfig, input: &str) -> Vec<NodeSpec> {
    let intents = classify_intents(input);
    let mut nodes: Vec<NodeSpec> = Vec::new();

    if intents.research {
        nodes.push(make_node(config, "research", RESEARCH_AGENT_ID, input, &[]));
    }
    if intents.build || nodes.is_empty() {
        // Research and build run in parallel; a lone build anchors the graph
        nodes.push(make_node(config, "build", WEB_DEV_AGENT_ID, input, &[]));
    }
    if intents.review {
        let upstream: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        nodes.push(make_node(
            config,
            "review",
            SYSTEM_AGENT_ID,
            input,
            &upstream.iter().map(String::as_str).collect::<Vec<_>>(),
        ));
    }

    // Without the research+build pair, steps serialize in construction order
    if !(intents.research && intents.build) {
        for i in 1..nodes.len() {
            if nodes[i].depends_on.is_empty() {
                let previous = nodes[i - 1].id.clone();
                nodes[i].depends_on = vec![previous];
            }
        }
    }

    nodes
}

fn make_node(
    config: &PlannerConfig,
    id: &str,
    agent_id: &str,
    input: &str,
    depends_on: &[&str],
) -> NodeSpec {
    let action = config
        .failure_policy
        .per_node
        .get(id)
        .copied()
        .unwrap_or(config.failure_policy.default_action);
    NodeSpec {
        id: id.to_string(),
        agent_id: agent_id.to_string(),
        input: input.to_string(),
        role: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        allow_failure: action == FailureAction::Continue,
        retries: config.failure_policy.retries,
        timeout_ms: Some(config.node_timeout_ms),
    }
}
