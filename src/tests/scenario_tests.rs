//! End-to-end scenarios: submit through intake, observe events, stored
//! records and cancellation behavior.

use super::test_helpers::*;
use crate::{
    agents::{AgentHandler, RuntimeContext},
    events::EventKind,
    intake::SubmitRequest,
    models::{AgentEnvelope, AgentResult, TaskStatus},
    orchestrator::NodeStatus,
    planner::{FailureAction, FailurePolicy, PlannerConfig},
    Result,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Records one execution window per agent id.
struct WindowedAgent {
    agent_id: String,
    delay_ms: u64,
    windows: Arc<Mutex<HashMap<String, (Instant, Instant)>>>,
}

#[async_trait]
impl AgentHandler for WindowedAgent {
    async fn invoke(&self, _input: Value, _ctx: &RuntimeContext) -> Result<String> {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let end = Instant::now();
        self.windows
            .lock()
            .await
            .insert(self.agent_id.clone(), (start, end));
        Ok(format!("{} done", self.agent_id))
    }
}

/// Captures the base input it was invoked with.
struct CapturingAgent {
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl AgentHandler for CapturingAgent {
    async fn invoke(&self, input: Value, _ctx: &RuntimeContext) -> Result<String> {
        self.seen.lock().await.push(input);
        let envelope = AgentEnvelope {
            ok: true,
            agent: "research-agent".into(),
            result: AgentResult::Text {
                content: "captured".into(),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[tokio::test]
async fn atomic_happy_path_emits_one_lifecycle_event_each() {
    let h = engine().await;
    register(
        &h,
        "research-agent",
        Arc::new(EnvelopeAgent {
            agent_id: "research-agent".into(),
            delay_ms: 10,
        }),
    )
    .await;

    let record = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "Summarize X".into(),
            agent: Some("research-agent".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.involved_agents, vec!["research-agent"]);
    assert!(record.duration_ms.unwrap() > 0);
    let output = record.output.unwrap();
    assert!(!output.is_empty());
    assert!(output.contains("research-agent result for"));

    let events = h.bus.history(&record.id, 100).await;
    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::TaskQueued), 1);
    assert_eq!(count(EventKind::TaskStarted), 1);
    assert_eq!(count(EventKind::TaskCompleted), 1);

    let position = |kind: EventKind| events.iter().position(|e| e.kind == kind).unwrap();
    assert!(position(EventKind::TaskQueued) < position(EventKind::TaskStarted));
    assert!(position(EventKind::TaskStarted) < position(EventKind::TaskCompleted));
    // The completed event carries the execution output
    assert!(events[position(EventKind::TaskCompleted)].data["output"]
        .as_str()
        .is_some());
}

#[tokio::test]
async fn dag_runs_research_and_build_in_parallel_before_review() {
    let h = engine().await;
    let windows: Arc<Mutex<HashMap<String, (Instant, Instant)>>> =
        Arc::new(Mutex::new(HashMap::new()));
    for agent_id in ["research-agent", "web-dev-agent", "system-agent"] {
        register(
            &h,
            agent_id,
            Arc::new(WindowedAgent {
                agent_id: agent_id.into(),
                delay_ms: 40,
                windows: windows.clone(),
            }),
        )
        .await;
    }

    let record = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "compare libraries and build an SDK and review it".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.multi_agent);

    // Node layout came from the rule planner
    let snapshot = h.orchestrator.snapshot(&record.id).await.unwrap();
    let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["research", "build", "review"]);

    // research.started and build.started precede review.started
    let steps: Vec<String> = h
        .bus
        .history(&record.id, 200)
        .await
        .iter()
        .filter(|e| e.kind == EventKind::TaskStep)
        .filter_map(|e| e.data["step"].as_str().map(String::from))
        .collect();
    let index_of = |step: &str| steps.iter().position(|s| s == step).unwrap();
    assert!(index_of("graph.node.research.running") < index_of("graph.node.review.running"));
    assert!(index_of("graph.node.build.running") < index_of("graph.node.review.running"));

    // review started only after both dependency windows closed
    let windows = windows.lock().await;
    let (research_start, research_end) = windows["research-agent"];
    let (build_start, build_end) = windows["web-dev-agent"];
    let (review_start, _) = windows["system-agent"];
    assert!(research_start < build_end && build_start < research_end);
    assert!(review_start >= research_end.max(build_end));
}

#[tokio::test]
async fn allowed_failure_with_aggregator_reports_partial_failures() {
    let h = engine().await;
    register(&h, "research-agent", Arc::new(FailingAgent)).await;
    register(
        &h,
        "web-dev-agent",
        Arc::new(EnvelopeAgent {
            agent_id: "web-dev-agent".into(),
            delay_ms: 5,
        }),
    )
    .await;
    register(
        &h,
        "system-agent",
        Arc::new(EnvelopeAgent {
            agent_id: "system-agent".into(),
            delay_ms: 5,
        }),
    )
    .await;

    let mut per_node = HashMap::new();
    per_node.insert("research".to_string(), FailureAction::Continue);
    let record = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "research the market and build a dashboard".into(),
            planner: Some(PlannerConfig {
                failure_policy: FailurePolicy {
                    default_action: FailureAction::Stop,
                    per_node,
                    retries: 0,
                },
                final_agent_id: Some("system-agent".into()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, TaskStatus::Completed);
    let output = record.output.unwrap();
    assert!(output.starts_with("system-agent result for"));
    assert!(output.contains("Partial failures:"));
    assert!(output.contains("- research: "));
    assert!(record
        .involved_agents
        .contains(&"research-agent".to_string()));
}

#[tokio::test]
async fn cancellation_during_dag_aborts_nodes_and_never_completes() {
    let h = engine().await;
    let aborts = Arc::new(AtomicUsize::new(0));
    for agent_id in ["research-agent", "web-dev-agent", "system-agent"] {
        register(
            &h,
            agent_id,
            Arc::new(HangingAgent {
                aborts_observed: aborts.clone(),
            }),
        )
        .await;
    }

    let record = h
        .pipeline
        .submit(SubmitRequest {
            input: "research the landscape and build the service".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let task_id = record.id.clone();

    let pipeline = h.pipeline.clone();
    let exec_id = task_id.clone();
    let execution = tokio::spawn(async move { pipeline.execute(&exec_id).await });

    // Wait until the build node is running, then cancel
    let mut saw_build_running = false;
    for _ in 0..100 {
        let steps: Vec<String> = h
            .bus
            .history(&task_id, 200)
            .await
            .iter()
            .filter(|e| e.kind == EventKind::TaskStep)
            .filter_map(|e| e.data["step"].as_str().map(String::from))
            .collect();
        if steps.iter().any(|s| s == "graph.node.build.running") {
            saw_build_running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_build_running);

    h.pipeline.cancel(&task_id).await.unwrap();
    let final_record = wait_terminal(&h, &task_id, Duration::from_secs(5)).await;
    let _ = execution.await.unwrap();

    assert_eq!(final_record.status, TaskStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(30)).await;
    // Both parallel nodes were running; both handlers observed the abort
    assert_eq!(aborts.load(Ordering::SeqCst), 2);

    let snapshot = h.orchestrator.snapshot(&task_id).await.unwrap();
    for node in &snapshot.nodes {
        assert_eq!(node.status, NodeStatus::Cancelled, "node {}", node.id);
    }

    // No completion event after the cancellation
    let events = h.bus.history(&task_id, 200).await;
    let cancelled_at = events
        .iter()
        .position(|e| e.kind == EventKind::TaskCancelled)
        .expect("task.cancelled event");
    assert!(!events[cancelled_at..]
        .iter()
        .any(|e| e.kind == EventKind::TaskCompleted));
}

#[tokio::test]
async fn conversation_history_flows_into_later_turns() {
    let h = engine().await;
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    register(
        &h,
        "research-agent",
        Arc::new(CapturingAgent { seen: seen.clone() }),
    )
    .await;

    let first = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "summarize the quarterly report".into(),
            agent: Some("research-agent".into()),
            conversation_id: Some("conv-42".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.status, TaskStatus::Completed);

    let second = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "now compare it to last quarter".into(),
            agent: Some("research-agent".into()),
            conversation_id: Some("conv-42".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.status, TaskStatus::Completed);

    let inputs = seen.lock().await;
    assert_eq!(inputs.len(), 2);
    // First turn had no history; second turn carries the first turn
    assert!(inputs[0]["history"].as_array().unwrap().is_empty());
    let history = inputs[1]["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0]["input"].as_str().unwrap(),
        "summarize the quarterly report"
    );
    assert_eq!(inputs[1]["conversation_id"], "conv-42");
}

#[tokio::test]
async fn reused_live_task_id_is_a_conflict() {
    let h = engine().await;
    let aborts = Arc::new(AtomicUsize::new(0));
    register(
        &h,
        "web-dev-agent",
        Arc::new(HangingAgent {
            aborts_observed: aborts.clone(),
        }),
    )
    .await;

    let record = h
        .pipeline
        .submit(SubmitRequest {
            input: "long running job".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let conflict = h
        .pipeline
        .submit(SubmitRequest {
            input: "reusing the id".into(),
            task_id: Some(record.id.clone()),
            ..Default::default()
        })
        .await;
    assert!(matches!(conflict, Err(crate::ForgeError::Conflict(_))));

    // Cleanup: cancel the hanging task before its execution even starts
    h.pipeline.cancel(&record.id).await.unwrap();
    assert!(h.cancellations.is_cancelled(&record.id).await);
    let pipeline = h.pipeline.clone();
    let cancelled = pipeline.execute(&record.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn task_timeout_surfaces_as_failed_with_timeout_code() {
    let h = engine().await;
    let aborts = Arc::new(AtomicUsize::new(0));
    register(
        &h,
        "web-dev-agent",
        Arc::new(HangingAgent {
            aborts_observed: aborts.clone(),
        }),
    )
    .await;

    let record = h
        .pipeline
        .submit_and_execute(SubmitRequest {
            input: "a job with a tight budget".into(),
            timeout_ms: Some(1000),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, TaskStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.code.as_deref(), Some("timeout"));
    assert!(error.message.contains("budget"));
}
