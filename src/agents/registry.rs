use super::{AgentHandler, AgentProfile, AgentState};
use crate::{ForgeError, Result};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct AgentEntry {
    profile: AgentProfile,
    handler: Arc<dyn AgentHandler>,
}

/// Owns the agent set for the process lifetime.
///
/// Registrations mutate under the write lock; lookups take read-lock
/// snapshots. The tag index is rebuilt on registration so tag lookups stay
/// O(1) on the hot path.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentEntry>>>,
    tag_index: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Duplicate ids are rejected.
    pub async fn register(
        &self,
        profile: AgentProfile,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&profile.id) {
            warn!("Agent {} already registered", profile.id);
            return Err(ForgeError::Conflict(format!(
                "agent {} already registered",
                profile.id
            )));
        }

        let mut tag_index = self.tag_index.write().await;
        for tag in &profile.tags {
            tag_index
                .entry(tag.clone())
                .or_default()
                .push(profile.id.clone());
        }

        info!("Registered agent: {} ({})", profile.name, profile.id);
        agents.insert(
            profile.id.clone(),
            AgentEntry { profile, handler },
        );
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .remove(agent_id)
            .ok_or_else(|| ForgeError::NotFound(format!("agent {agent_id}")))?;

        let mut tag_index = self.tag_index.write().await;
        for tag in &entry.profile.tags {
            if let Some(ids) = tag_index.get_mut(tag) {
                ids.retain(|id| id != agent_id);
            }
        }

        info!("Unregistered agent: {}", agent_id);
        Ok(())
    }

    pub async fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|e| e.handler.clone())
    }

    pub async fn profile(&self, agent_id: &str) -> Option<AgentProfile> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|e| e.profile.clone())
    }

    pub async fn all_profiles(&self) -> Vec<AgentProfile> {
        let agents = self.agents.read().await;
        agents.values().map(|e| e.profile.clone()).collect()
    }

    pub async fn all_ids(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        agents.keys().cloned().collect()
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents.contains_key(agent_id)
    }

    /// First registered agent carrying the tag.
    pub async fn first_with_tag(&self, tag: &str) -> Option<String> {
        let tag_index = self.tag_index.read().await;
        tag_index.get(tag).and_then(|ids| ids.first().cloned())
    }

    /// Pseudo-random pick across the whole agent set; the scheduler's
    /// fallback when neither id nor tag was requested.
    pub async fn random_id(&self) -> Option<String> {
        let agents = self.agents.read().await;
        let ids: Vec<&String> = agents.keys().collect();
        ids.choose(&mut rand::thread_rng()).map(|s| s.to_string())
    }

    pub async fn set_state(&self, agent_id: &str, state: AgentState) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            debug!("Agent {} state -> {:?}", agent_id, state);
            entry.profile.state = state;
        }
    }

    pub async fn state_of(&self, agent_id: &str) -> Option<AgentState> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|e| e.profile.state)
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::RuntimeContext;
    use async_trait::async_trait;

    struct NoopAgent;

    #[async_trait]
    impl AgentHandler for NoopAgent {
        async fn invoke(
            &self,
            _input: serde_json::Value,
            _ctx: &RuntimeContext,
        ) -> Result<String> {
            Ok("ok".to_string())
        }
    }

    fn profile(id: &str, tags: &[&str]) -> AgentProfile {
        AgentProfile::new(id, id, tags.iter().map(|t| t.to_string()).collect())
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = AgentRegistry::new();
        registry
            .register(profile("research-agent", &["research"]), Arc::new(NoopAgent))
            .await
            .unwrap();

        assert_eq!(registry.count().await, 1);
        assert!(registry.handler("research-agent").await.is_some());
        assert_eq!(
            registry.state_of("research-agent").await,
            Some(AgentState::Uninitialized)
        );

        // Duplicate registration is rejected
        let result = registry
            .register(profile("research-agent", &[]), Arc::new(NoopAgent))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tag_index_tracks_registration_lifecycle() {
        let registry = AgentRegistry::new();
        registry
            .register(profile("web-dev-agent", &["build", "frontend"]), Arc::new(NoopAgent))
            .await
            .unwrap();

        assert_eq!(
            registry.first_with_tag("build").await.as_deref(),
            Some("web-dev-agent")
        );

        registry.unregister("web-dev-agent").await.unwrap();
        assert!(registry.first_with_tag("build").await.is_none());
    }

    #[tokio::test]
    async fn random_pick_returns_registered_agent() {
        let registry = AgentRegistry::new();
        assert!(registry.random_id().await.is_none());

        registry
            .register(profile("a", &[]), Arc::new(NoopAgent))
            .await
            .unwrap();
        registry
            .register(profile("b", &[]), Arc::new(NoopAgent))
            .await
            .unwrap();

        let picked = registry.random_id().await.unwrap();
        assert!(picked == "a" || picked == "b");
    }
}
