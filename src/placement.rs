//! Placement Engine (C2) — agent -> worker assignment.
//!
//! Candidate selection mirrors `orchestration::scheduler`'s split between a
//! pure selection function and an owned assignment map, generalized here
//! from capability scoring to a first-fit-by-headroom policy. Selection is a
//! pure function over a `Worker` snapshot slice; the engine itself only owns
//! the assignment map, so callers (the Traffic Controller) can take the
//! PoolRegistry lock, snapshot workers, select, adjust occupancy, and only
//! then take this engine's lock to record the assignment — preserving the
//! fixed Registry -> Placement lock order without this module reaching back
//! into `pool`.

use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::model::{AgentId, Worker, WorkerId};

/// Current agent -> worker assignments. Guarded by the caller's own
/// `tokio::sync::RwLock`, same convention as `PoolRegistry`.
#[derive(Debug, Default)]
pub struct PlacementEngine {
    assignments: HashMap<AgentId, WorkerId>,
}

impl PlacementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// First-fit selection: the first worker (in the pool's registration
    /// order) that is `Known` and has spare capacity. Ties are not broken by
    /// load; the registration-order walk is itself the tie-break, favoring
    /// predictable, low-churn placement over perfectly balanced occupancy.
    pub fn select_worker(workers: &[Worker]) -> Option<WorkerId> {
        workers
            .iter()
            .find(|w| w.has_headroom())
            .map(|w| w.id.clone())
    }

    pub fn assign(&mut self, agent_id: AgentId, worker_id: WorkerId) -> Result<()> {
        if self.assignments.contains_key(&agent_id) {
            return Err(CoreError::conflict(format!(
                "agent {agent_id} already has a placement"
            )));
        }
        self.assignments.insert(agent_id, worker_id);
        Ok(())
    }

    /// Overwrite an existing assignment, used when relocating an agent off a
    /// lost worker. Returns the prior worker id, if any.
    pub fn reassign(&mut self, agent_id: AgentId, worker_id: WorkerId) -> Option<WorkerId> {
        self.assignments.insert(agent_id, worker_id)
    }

    pub fn unassign(&mut self, agent_id: &AgentId) -> Option<WorkerId> {
        self.assignments.remove(agent_id)
    }

    pub fn worker_of(&self, agent_id: &AgentId) -> Option<WorkerId> {
        self.assignments.get(agent_id).cloned()
    }

    /// All agents currently mapped to the given worker, stable-ordered by
    /// insertion is not guaranteed (`HashMap`); callers that need a
    /// deterministic relocation order should sort the result.
    pub fn agents_on(&self, worker_id: &WorkerId) -> Vec<AgentId> {
        self.assignments
            .iter()
            .filter(|(_, w)| *w == worker_id)
            .map(|(a, _)| *a)
            .collect()
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerState;

    fn worker(id: &str, capacity: u32, occupancy: u32, state: WorkerState) -> Worker {
        Worker {
            id: WorkerId(id.to_string()),
            url: format!("{id}:8080"),
            capacity,
            occupancy,
            state,
            consecutive_unreachable: 0,
            last_placement_at: None,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn select_worker_skips_full_and_unreachable() {
        let workers = vec![
            worker("w1", 1, 1, WorkerState::Known),
            worker("w2", 2, 2, WorkerState::Known),
            worker("w3", 2, 0, WorkerState::Unreachable),
            worker("w4", 2, 1, WorkerState::Known),
        ];
        let selected = PlacementEngine::select_worker(&workers);
        assert_eq!(selected, Some(WorkerId("w4".to_string())));
    }

    #[test]
    fn select_worker_none_when_all_full() {
        let workers = vec![worker("w1", 1, 1, WorkerState::Known)];
        assert!(PlacementEngine::select_worker(&workers).is_none());
    }

    #[test]
    fn assign_rejects_duplicate() {
        let mut engine = PlacementEngine::new();
        let agent = AgentId::new();
        engine.assign(agent, WorkerId("w1".into())).unwrap();
        assert!(engine.assign(agent, WorkerId("w2".into())).is_err());
    }

    #[test]
    fn reassign_overwrites_and_agents_on_reflects_it() {
        let mut engine = PlacementEngine::new();
        let agent = AgentId::new();
        engine.assign(agent, WorkerId("w1".into())).unwrap();
        engine.reassign(agent, WorkerId("w2".into()));
        assert!(engine.agents_on(&WorkerId("w1".into())).is_empty());
        assert_eq!(engine.agents_on(&WorkerId("w2".into())), vec![agent]);
    }
}
