use crate::{constants, planner::FailureAction, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level runtime configuration, loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub engine: EngineConfig,
    pub multi_agent: MultiAgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

/// Tunables for the execution engine: scheduler, queue, orchestrator, store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub default_max_retries: u32,
    pub max_input_length: usize,
    pub max_timeout_ms: u64,
    pub node_timeout_ms: u64,
    pub lease_ms: u64,
    pub event_ring_capacity: usize,
    pub queue_history_capacity: usize,
    pub retention_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: constants::DEFAULT_MAX_CONCURRENT_TASKS,
            base_backoff_ms: constants::DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_MAX_BACKOFF_MS,
            default_max_retries: constants::DEFAULT_MAX_RETRIES,
            max_input_length: constants::MAX_INPUT_LENGTH,
            max_timeout_ms: constants::DEFAULT_MAX_TIMEOUT_MS,
            node_timeout_ms: constants::DEFAULT_NODE_TIMEOUT_MS,
            lease_ms: constants::DEFAULT_LEASE_MS,
            event_ring_capacity: constants::EVENT_RING_CAPACITY,
            queue_history_capacity: constants::QUEUE_HISTORY_CAPACITY,
            retention_days: constants::DEFAULT_RETENTION_DAYS,
            cleanup_interval_secs: constants::CLEANUP_INTERVAL_SECS,
        }
    }
}

/// Multi-agent planning defaults applied when a submission does not carry
/// its own planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentSettings {
    pub enabled: bool,
    pub force: bool,
    pub default_failure_action: FailureAction,
    pub node_retries: u32,
}

impl Default for MultiAgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            default_failure_action: FailureAction::Stop,
            node_retries: 0,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let api = ApiConfig {
            host: env::var("TASKFORGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("TASKFORGE_PORT", 7700),
            allowed_origins: env::var("TASKFORGE_ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            max_concurrent_tasks: env_parse(
                "TASKFORGE_MAX_CONCURRENT_TASKS",
                defaults.max_concurrent_tasks,
            ),
            base_backoff_ms: env_parse("TASKFORGE_BASE_BACKOFF_MS", defaults.base_backoff_ms),
            max_backoff_ms: env_parse("TASKFORGE_MAX_BACKOFF_MS", defaults.max_backoff_ms),
            default_max_retries: env_parse(
                "TASKFORGE_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            max_input_length: env_parse("TASKFORGE_MAX_INPUT_LENGTH", defaults.max_input_length),
            max_timeout_ms: env_parse("TASKFORGE_MAX_TIMEOUT_MS", defaults.max_timeout_ms),
            node_timeout_ms: env_parse("TASKFORGE_NODE_TIMEOUT_MS", defaults.node_timeout_ms),
            lease_ms: env_parse("TASKFORGE_LEASE_MS", defaults.lease_ms),
            event_ring_capacity: env_parse(
                "TASKFORGE_EVENT_RING_CAPACITY",
                defaults.event_ring_capacity,
            ),
            queue_history_capacity: env_parse(
                "TASKFORGE_QUEUE_HISTORY_CAPACITY",
                defaults.queue_history_capacity,
            ),
            retention_days: env_parse("TASKFORGE_RETENTION_DAYS", defaults.retention_days),
            cleanup_interval_secs: env_parse(
                "TASKFORGE_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval_secs,
            ),
        };

        let multi_agent = MultiAgentSettings {
            enabled: env_parse("TASKFORGE_MULTI_AGENT_ENABLED", true),
            force: env_parse("TASKFORGE_MULTI_AGENT_FORCE", false),
            default_failure_action: if env::var("TASKFORGE_FAILURE_ACTION")
                .map(|v| v.eq_ignore_ascii_case("continue"))
                .unwrap_or(false)
            {
                FailureAction::Continue
            } else {
                FailureAction::Stop
            },
            node_retries: env_parse("TASKFORGE_NODE_RETRIES", 0),
        };

        Ok(Self {
            api,
            engine,
            multi_agent,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 7700,
                allowed_origins: Vec::new(),
            },
            engine: EngineConfig::default(),
            multi_agent: MultiAgentSettings::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
