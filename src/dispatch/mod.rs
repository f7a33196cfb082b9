//! Load-aware dispatch hints for the intake surface
//!
//! Separate from queue selection: each registered agent gets a slot whose
//! load score ticks up on busy and down on idle. The intake path uses
//! `select_for` as a hint only; the scheduler's own selection rules are
//! authoritative.

use crate::constants::LOAD_STEP;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-agent load slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSlot {
    pub agent_id: String,
    pub is_busy: bool,
    pub current_task_id: Option<String>,
    pub load_score: u8,
    pub idle_counter: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_time: f64,
}

impl AgentSlot {
    fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            is_busy: false,
            current_task_id: None,
            load_score: 0,
            idle_counter: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            average_execution_time: 0.0,
        }
    }
}

/// A dispatch hint: which agent to prefer and the wait it implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchHint {
    pub agent_id: String,
    pub estimated_wait_ms: u64,
}

/// Agent-slot load tracking for UI display and selection hints.
#[derive(Clone, Default)]
pub struct LoadAwareDispatcher {
    slots: Arc<RwLock<HashMap<String, AgentSlot>>>,
}

impl LoadAwareDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure_slot(&self, agent_id: &str) {
        let mut slots = self.slots.write().await;
        slots
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSlot::new(agent_id.to_string()));
    }

    pub async fn remove_slot(&self, agent_id: &str) {
        let mut slots = self.slots.write().await;
        slots.remove(agent_id);
    }

    pub async fn mark_busy(&self, agent_id: &str, task_id: &str) {
        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSlot::new(agent_id.to_string()));
        slot.is_busy = true;
        slot.current_task_id = Some(task_id.to_string());
        slot.idle_counter = 0;
        slot.load_score = slot.load_score.saturating_add(LOAD_STEP).min(100);
        debug!("Slot {} busy (load {})", agent_id, slot.load_score);
    }

    pub async fn mark_idle(&self, agent_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(agent_id) {
            slot.is_busy = false;
            slot.current_task_id = None;
            slot.idle_counter += 1;
            slot.load_score = slot.load_score.saturating_sub(LOAD_STEP);
            debug!("Slot {} idle (load {})", agent_id, slot.load_score);
        }
    }

    pub async fn record_completion(&self, agent_id: &str, execution_secs: f64) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(agent_id) {
            slot.tasks_completed += 1;
            slot.average_execution_time = (slot.average_execution_time
                * (slot.tasks_completed - 1) as f64
                + execution_secs)
                / slot.tasks_completed as f64;
        }
    }

    pub async fn record_failure(&self, agent_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(agent_id) {
            slot.tasks_failed += 1;
        }
    }

    /// Prefer the slot the task type maps to even when busy; otherwise the
    /// least-loaded slot. The wait estimate scales linearly with load.
    pub async fn select_for(&self, task_type: &str) -> Option<DispatchHint> {
        let slots = self.slots.read().await;
        if slots.is_empty() {
            return None;
        }

        let mapped = format!("{task_type}-agent");
        let slot = match slots.get(&mapped) {
            Some(slot) => slot,
            None => slots.values().min_by_key(|s| s.load_score)?,
        };

        Some(DispatchHint {
            agent_id: slot.agent_id.clone(),
            estimated_wait_ms: estimated_wait_ms(slot.load_score),
        })
    }

    pub async fn slot(&self, agent_id: &str) -> Option<AgentSlot> {
        let slots = self.slots.read().await;
        slots.get(agent_id).cloned()
    }

    pub async fn all_slots(&self) -> Vec<AgentSlot> {
        let slots = self.slots.read().await;
        slots.values().cloned().collect()
    }
}

fn estimated_wait_ms(load_score: u8) -> u64 {
    (load_score as u64 * 1000).div_ceil(100)
}
