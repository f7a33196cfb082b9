use super::*;
use crate::agents::{AgentHandler, AgentProfile, AgentRegistry};
use crate::events::EventBus;
use crate::kernel::Kernel;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Records one (label, start, end) window per invocation.
type Timeline = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

struct TimedAgent {
    delay_ms: u64,
    timeline: Timeline,
}

#[async_trait]
impl AgentHandler for TimedAgent {
    async fn invoke(
        &self,
        input: serde_json::Value,
        _ctx: &crate::agents::RuntimeContext,
    ) -> crate::Result<String> {
        let label = input["objective"].as_str().unwrap_or("?").to_string();
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let end = Instant::now();
        self.timeline.lock().await.push((label.clone(), start, end));
        Ok(format!("out:{label}"))
    }
}

struct FailingAgent;

#[async_trait]
impl AgentHandler for FailingAgent {
    async fn invoke(
        &self,
        _input: serde_json::Value,
        _ctx: &crate::agents::RuntimeContext,
    ) -> crate::Result<String> {
        Err(ForgeError::Agent {
            message: "deliberate failure".into(),
        })
    }
}

struct FlakyAgent {
    failures_left: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentHandler for FlakyAgent {
    async fn invoke(
        &self,
        _input: serde_json::Value,
        _ctx: &crate::agents::RuntimeContext,
    ) -> crate::Result<String> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(ForgeError::Transient("warming up".into()))
        } else {
            Ok("steady".into())
        }
    }
}

/// Hangs until aborted; counts aborts the way a model adapter would, by
/// watching the signal it was handed.
struct HangingAgent {
    aborts_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentHandler for HangingAgent {
    async fn invoke(
        &self,
        _input: serde_json::Value,
        ctx: &crate::agents::RuntimeContext,
    ) -> crate::Result<String> {
        let observer = self.aborts_observed.clone();
        let signal = ctx.cancel.clone();
        tokio::spawn(async move {
            signal.cancelled().await;
            observer.fetch_add(1, Ordering::SeqCst);
        });
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok("never".into()),
            _ = ctx.cancel.cancelled() => {
                Err(ForgeError::Cancelled("handler observed abort".into()))
            }
        }
    }
}

struct EchoDepsAgent;

#[async_trait]
impl AgentHandler for EchoDepsAgent {
    async fn invoke(
        &self,
        input: serde_json::Value,
        _ctx: &crate::agents::RuntimeContext,
    ) -> crate::Result<String> {
        let deps = input["dep_outputs"]
            .as_object()
            .map(|m| {
                let mut keys: Vec<_> = m.keys().cloned().collect();
                keys.sort();
                keys.join(",")
            })
            .unwrap_or_default();
        Ok(format!("deps=[{deps}]"))
    }
}

struct TestRig {
    orchestrator: Orchestrator,
    registry: Arc<AgentRegistry>,
}

async fn rig(config: OrchestratorConfig) -> TestRig {
    let registry = Arc::new(AgentRegistry::new());
    let bus = Arc::new(EventBus::new(100));
    let kernel = Arc::new(Kernel::new(registry.clone(), bus.clone()));
    TestRig {
        orchestrator: Orchestrator::new(kernel, bus, config),
        registry,
    }
}

async fn add_agent(rig: &TestRig, id: &str, handler: Arc<dyn AgentHandler>) {
    rig.registry
        .register(AgentProfile::new(id, id, vec![]), handler)
        .await
        .unwrap();
}

fn node(id: &str, agent: &str, deps: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        agent_id: agent.to_string(),
        input: id.to_string(),
        role: None,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        allow_failure: false,
        retries: 0,
        timeout_ms: None,
    }
}

#[tokio::test]
async fn atomic_workflow_runs_single_invocation() {
    let rig = rig(OrchestratorConfig::default()).await;
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    add_agent(
        &rig,
        "solo",
        Arc::new(TimedAgent {
            delay_ms: 5,
            timeline: timeline.clone(),
        }),
    )
    .await;

    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({ "task_id": "t1" }),
            WorkflowSpec::Atomic {
                agent_id: "solo".into(),
                input: "single step".into(),
                timeout_ms: None,
            },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(result.outputs["main"], "out:single step");
    assert_eq!(timeline.lock().await.len(), 1);
}

#[tokio::test]
async fn parallel_nodes_overlap_and_dependent_waits() {
    let rig = rig(OrchestratorConfig::default()).await;
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    add_agent(
        &rig,
        "worker",
        Arc::new(TimedAgent {
            delay_ms: 50,
            timeline: timeline.clone(),
        }),
    )
    .await;

    let nodes = vec![
        node("research", "worker", &[]),
        node("build", "worker", &[]),
        node("review", "worker", &["research", "build"]),
    ];
    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Succeeded);

    let windows = timeline.lock().await;
    let window = |label: &str| {
        windows
            .iter()
            .find(|(l, _, _)| l == label)
            .map(|(_, s, e)| (*s, *e))
            .unwrap()
    };
    let (research_start, research_end) = window("research");
    let (build_start, build_end) = window("build");
    let (review_start, _) = window("review");

    // research and build ran in parallel
    assert!(research_start < build_end && build_start < research_end);
    // review started only after both dependencies ended
    assert!(review_start >= research_end);
    assert!(review_start >= build_end);
}

#[tokio::test]
async fn dep_outputs_flow_into_dependents() {
    let rig = rig(OrchestratorConfig::default()).await;
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    add_agent(
        &rig,
        "producer",
        Arc::new(TimedAgent {
            delay_ms: 1,
            timeline,
        }),
    )
    .await;
    add_agent(&rig, "consumer", Arc::new(EchoDepsAgent)).await;

    let nodes = vec![
        node("a", "producer", &[]),
        node("b", "producer", &[]),
        node("join", "consumer", &["a", "b"]),
    ];
    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.outputs["join"], "deps=[a,b]");
}

#[tokio::test]
async fn allowed_failure_collapses_into_failures_list() {
    let rig = rig(OrchestratorConfig::default()).await;
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    add_agent(&rig, "fragile", Arc::new(FailingAgent)).await;
    add_agent(
        &rig,
        "solid",
        Arc::new(TimedAgent {
            delay_ms: 1,
            timeline,
        }),
    )
    .await;

    let mut fragile = node("research", "fragile", &[]);
    fragile.allow_failure = true;
    let nodes = vec![fragile, node("build", "solid", &[])];

    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node_id, "research");
    assert!(result.outputs.contains_key("build"));
    assert!(!result.outputs.contains_key("research"));
}

#[tokio::test]
async fn hard_failure_cancels_running_and_skips_pending() {
    let rig = rig(OrchestratorConfig::default()).await;
    let aborts = Arc::new(AtomicUsize::new(0));
    add_agent(&rig, "fragile", Arc::new(FailingAgent)).await;
    add_agent(
        &rig,
        "hanging",
        Arc::new(HangingAgent {
            aborts_observed: aborts.clone(),
        }),
    )
    .await;

    let nodes = vec![
        node("doomed", "fragile", &[]),
        node("slow", "hanging", &[]),
        node("after", "hanging", &["slow"]),
    ];
    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failures[0].node_id, "doomed");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(aborts.load(Ordering::SeqCst), 1);

    let snapshot = rig.orchestrator.snapshot("t1").await.unwrap();
    let status_of = |id: &str| {
        snapshot
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.status)
            .unwrap()
    };
    assert_eq!(status_of("doomed"), NodeStatus::Failed);
    assert_eq!(status_of("slow"), NodeStatus::Cancelled);
    assert_eq!(status_of("after"), NodeStatus::Skipped);
}

#[tokio::test]
async fn node_timeout_fails_only_that_node() {
    let rig = rig(OrchestratorConfig {
        node_timeout_ms: 30,
        base_backoff_ms: 5,
    })
    .await;
    let timeline: Timeline = Arc::new(Mutex::new(Vec::new()));
    add_agent(
        &rig,
        "hanging",
        Arc::new(HangingAgent {
            aborts_observed: Arc::new(AtomicUsize::new(0)),
        }),
    )
    .await;
    add_agent(
        &rig,
        "quick",
        Arc::new(TimedAgent {
            delay_ms: 1,
            timeline,
        }),
    )
    .await;

    let mut slow = node("slow", "hanging", &[]);
    slow.allow_failure = true;
    let nodes = vec![slow, node("fast", "quick", &[])];

    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node_id, "slow");
    assert!(result.failures[0].error.contains("exceeded"));
    assert!(result.outputs.contains_key("fast"));
}

#[tokio::test]
async fn node_retries_recover_transient_failures() {
    let rig = rig(OrchestratorConfig {
        node_timeout_ms: 1000,
        base_backoff_ms: 5,
    })
    .await;
    add_agent(
        &rig,
        "flaky",
        Arc::new(FlakyAgent {
            failures_left: Arc::new(AtomicUsize::new(1)),
        }),
    )
    .await;

    let mut retried = node("warmup", "flaky", &[]);
    retried.retries = 2;

    let observed: Arc<std::sync::Mutex<Vec<String>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_log = observed.clone();
    let opts = ExecuteOptions {
        cancel: CancellationToken::new(),
        on_node_event: Some(Arc::new(move |event: &NodeEvent| {
            sink_log.lock().unwrap().push(event.trace());
        })),
    };

    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph {
                nodes: vec![retried],
            },
            opts,
        )
        .await
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(result.outputs["warmup"], "steady");

    let traces = observed.lock().unwrap();
    assert!(traces.contains(&"graph.node.warmup.retrying".to_string()));
    assert!(traces.contains(&"graph.node.warmup.succeeded".to_string()));
}

#[tokio::test]
async fn workflow_cancellation_aborts_running_and_pending_nodes() {
    let rig = rig(OrchestratorConfig::default()).await;
    let aborts = Arc::new(AtomicUsize::new(0));
    add_agent(
        &rig,
        "hanging",
        Arc::new(HangingAgent {
            aborts_observed: aborts.clone(),
        }),
    )
    .await;

    let nodes = vec![
        node("build", "hanging", &[]),
        node("review", "hanging", &["build"]),
    ];
    let cancel = CancellationToken::new();
    let opts = ExecuteOptions {
        cancel: cancel.clone(),
        on_node_event: None,
    };

    let orchestrator = rig.orchestrator.clone();
    let handle = tokio::spawn(async move {
        orchestrator
            .execute("t1", json!({}), WorkflowSpec::Graph { nodes }, opts)
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cancellation must finish promptly")
        .unwrap();
    assert!(matches!(result, Err(ForgeError::Cancelled(_))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(aborts.load(Ordering::SeqCst), 1);

    let snapshot = rig.orchestrator.snapshot("t1").await.unwrap();
    for view in &snapshot.nodes {
        assert_eq!(view.status, NodeStatus::Cancelled, "node {}", view.id);
    }
}

#[tokio::test]
async fn cyclic_graph_is_rejected_before_execution() {
    let rig = rig(OrchestratorConfig::default()).await;
    let nodes = vec![node("a", "x", &["b"]), node("b", "x", &["a"])];
    let result = rig
        .orchestrator
        .execute(
            "t1",
            json!({}),
            WorkflowSpec::Graph { nodes },
            ExecuteOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(ForgeError::Workflow(_))));
}
