use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use taskforge::{
    agents::{AgentHandler, AgentProfile, AgentRegistry, RuntimeContext},
    api::{ApiServer, AppState},
    cancel::CancellationRegistry,
    config::Config,
    dispatch::LoadAwareDispatcher,
    events::EventBus,
    intake::{IntakeConfig, IntakePipeline},
    kernel::Kernel,
    models::{AgentEnvelope, AgentResult},
    orchestrator::{Orchestrator, OrchestratorConfig},
    planner::{
        FailurePolicy, PlannerConfig, PlannerMode, RESEARCH_AGENT_ID, SYSTEM_AGENT_ID,
        WEB_DEV_AGENT_ID,
    },
    queue::PriorityQueue,
    scheduler::{Scheduler, SchedulerConfig},
    store::TaskStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Placeholder handler wired to the default agent ids so the runtime is
/// usable out of the box; real deployments register their own handlers.
struct StubAgent {
    agent_id: String,
}

#[async_trait]
impl AgentHandler for StubAgent {
    async fn invoke(
        &self,
        input: serde_json::Value,
        _ctx: &RuntimeContext,
    ) -> taskforge::Result<String> {
        let objective = input["objective"]
            .as_str()
            .or_else(|| input["query"].as_str())
            .unwrap_or_default();
        let envelope = AgentEnvelope {
            ok: true,
            agent: self.agent_id.clone(),
            result: AgentResult::Text {
                content: format!("[{}] acknowledged: {objective}", self.agent_id),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Taskforge orchestration runtime");

    let config = Config::load()?;

    let bus = Arc::new(EventBus::new(config.engine.event_ring_capacity));
    let store = Arc::new(TaskStore::new());
    let cancellations = Arc::new(CancellationRegistry::new());
    let registry = Arc::new(AgentRegistry::new());
    let dispatcher = Arc::new(LoadAwareDispatcher::new());
    let kernel = Arc::new(Kernel::new(registry.clone(), bus.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        kernel.clone(),
        bus.clone(),
        OrchestratorConfig {
            node_timeout_ms: config.engine.node_timeout_ms,
            base_backoff_ms: config.engine.base_backoff_ms,
        },
    ));
    let queue = Arc::new(PriorityQueue::new(
        config.engine.base_backoff_ms,
        config.engine.max_backoff_ms,
        config.engine.queue_history_capacity,
    ));
    let scheduler = Scheduler::new(
        queue,
        registry.clone(),
        kernel.clone(),
        store.clone(),
        cancellations.clone(),
        bus.clone(),
        SchedulerConfig {
            max_concurrent: config.engine.max_concurrent_tasks,
            base_backoff_ms: config.engine.base_backoff_ms,
            max_backoff_ms: config.engine.max_backoff_ms,
            default_max_retries: config.engine.default_max_retries,
        },
    );

    // No task survives a restart in a live state
    let normalized = store.normalize_on_startup().await;
    if normalized > 0 {
        info!("Normalized {} stale tasks at startup", normalized);
    }

    for agent_id in [WEB_DEV_AGENT_ID, RESEARCH_AGENT_ID, SYSTEM_AGENT_ID] {
        kernel
            .register(
                AgentProfile::new(agent_id, agent_id, vec![agent_tag(agent_id).to_string()]),
                Arc::new(StubAgent {
                    agent_id: agent_id.to_string(),
                }),
            )
            .await?;
        kernel.start(agent_id).await?;
        dispatcher.ensure_slot(agent_id).await;
    }

    let pipeline = Arc::new(IntakePipeline::new(
        store.clone(),
        bus.clone(),
        cancellations,
        registry.clone(),
        dispatcher.clone(),
        orchestrator.clone(),
        IntakeConfig {
            max_input_length: config.engine.max_input_length,
            max_timeout_ms: config.engine.max_timeout_ms,
            default_planner: PlannerConfig {
                enabled: config.multi_agent.enabled,
                mode: if config.multi_agent.force {
                    PlannerMode::Force
                } else {
                    PlannerMode::Auto
                },
                failure_policy: FailurePolicy {
                    default_action: config.multi_agent.default_failure_action,
                    retries: config.multi_agent.node_retries,
                    ..Default::default()
                },
                node_timeout_ms: config.engine.node_timeout_ms,
                ..Default::default()
            },
            ..Default::default()
        },
    )?);

    let api_server = ApiServer::new(
        config.api.clone(),
        AppState {
            pipeline,
            store: store.clone(),
            bus,
            registry,
            dispatcher,
            orchestrator,
            started_at: Instant::now(),
        },
    );

    let shutdown = CancellationToken::new();
    let retention_store = store.clone();
    let retention_days = config.engine.retention_days;
    let cleanup_interval = config.engine.cleanup_interval_secs;
    let retention_shutdown = shutdown.clone();
    let retention = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = retention_shutdown.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(cleanup_interval)) => {
                    retention_store.delete_older_than(retention_days).await;
                }
            }
        }
    });

    let scheduler_shutdown = shutdown.clone();
    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        _ = scheduler.run_loop(scheduler_shutdown) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    retention.abort();
    info!("Taskforge shutdown complete");
    Ok(())
}

fn agent_tag(agent_id: &str) -> &str {
    agent_id.strip_suffix("-agent").unwrap_or(agent_id)
}
