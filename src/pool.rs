//! PoolRegistry (C1) — authoritative view of worker inventory.
//!
//! Mirrors `orchestration::worker_registry::WorkerRegistry`'s shape (a
//! capability-indexed worker pool), generalized here from capability
//! matching to capacity/occupancy tracking.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{Worker, WorkerId, WorkerState, validate_worker_url};

/// Consecutive missed refresh ticks after which a worker is removed.
pub const UNREACHABLE_REMOVAL_THRESHOLD: u32 = 3;

/// A point-in-time view of a worker, returned by `list_workers`.
pub type WorkerSnapshot = Worker;

#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub added: Vec<WorkerId>,
    pub marked_unreachable: Vec<WorkerId>,
    pub removed: Vec<WorkerId>,
}

/// Inventory of known agent-set workers. Every mutation is serialized by the
/// caller holding the registry behind a single `tokio::sync::RwLock` — this
/// type itself has no internal locking.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    workers: HashMap<WorkerId, Worker>,
    /// Insertion order, used by the first-fit selection policy in `placement`.
    order: Vec<WorkerId>,
    consecutive_refresh_failures: u32,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent registration. If already known with a different URL,
    /// updates the URL and marks it Known without resetting occupancy.
    pub fn register(&mut self, worker_id: WorkerId, url: String, capacity: u32) -> Result<()> {
        if capacity == 0 {
            return Err(CoreError::validation(
                "worker capacity must be positive; capacity 0 is a misconfiguration",
            ));
        }
        validate_worker_url(&url)?;

        match self.workers.get_mut(&worker_id) {
            Some(existing) => {
                existing.url = url;
                existing.state = WorkerState::Known;
                existing.consecutive_unreachable = 0;
                debug!(worker = %worker_id, "re-registered worker, occupancy retained");
            }
            None => {
                self.order.push(worker_id.clone());
                self.workers.insert(
                    worker_id.clone(),
                    Worker {
                        id: worker_id.clone(),
                        url,
                        capacity,
                        occupancy: 0,
                        state: WorkerState::Known,
                        consecutive_unreachable: 0,
                        last_placement_at: None,
                        registered_at: Utc::now(),
                    },
                );
                info!(worker = %worker_id, capacity, "registered new worker");
            }
        }
        Ok(())
    }

    pub fn unregister(&mut self, worker_id: &WorkerId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::not_found(format!("unknown worker: {worker_id}")))?;
        worker.state = WorkerState::Removed;
        info!(worker = %worker_id, "worker removed from pool");
        Ok(())
    }

    pub fn list_workers(&self) -> Vec<WorkerSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.workers.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// The only code path permitted to mutate occupancy. Fails rather than
    /// violating I3 (capacity) or going negative.
    pub fn adjust_occupancy(&mut self, worker_id: &WorkerId, delta: i64) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::not_found(format!("unknown worker: {worker_id}")))?;

        let new_value = worker.occupancy as i64 + delta;
        if new_value < 0 {
            return Err(CoreError::conflict(format!(
                "occupancy underflow on worker {worker_id}"
            )));
        }
        if new_value as u32 > worker.capacity {
            return Err(CoreError::conflict(format!(
                "occupancy {new_value} would exceed capacity {} on worker {worker_id}",
                worker.capacity
            )));
        }
        worker.occupancy = new_value as u32;
        if delta > 0 {
            worker.last_placement_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Reconcile against an externally-fetched inventory. Never empties the
    /// registry on its own — callers are expected to call this with an empty
    /// `external` only when the collaborator genuinely reported nothing, and
    /// even then existing workers are only marked Unreachable, not dropped.
    pub fn refresh(&mut self, external: &[(WorkerId, String)]) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        let seen: std::collections::HashSet<&WorkerId> =
            external.iter().map(|(id, _)| id).collect();

        for (id, url) in external {
            if !self.workers.contains_key(id) {
                if self.register(id.clone(), url.clone(), 1).is_ok() {
                    outcome.added.push(id.clone());
                }
            } else if let Some(w) = self.workers.get_mut(id) {
                w.state = WorkerState::Known;
                w.consecutive_unreachable = 0;
            }
        }

        for id in self.order.clone() {
            if seen.contains(&id) {
                continue;
            }
            if let Some(w) = self.workers.get_mut(&id) {
                if w.state == WorkerState::Removed {
                    continue;
                }
                w.consecutive_unreachable += 1;
                w.state = WorkerState::Unreachable;
                outcome.marked_unreachable.push(id.clone());
                if w.consecutive_unreachable >= UNREACHABLE_REMOVAL_THRESHOLD {
                    w.state = WorkerState::Removed;
                    outcome.removed.push(id.clone());
                    warn!(worker = %id, "worker removed after repeated unreachable observations");
                }
            }
        }

        outcome
    }

    /// Workers with zero occupancy that have gone `idle_for` without a
    /// placement, counting from `registered_at` if they have never received
    /// one. Used by the empty-set reaper to flag (not remove) candidates for
    /// external deprovisioning.
    pub fn idle_workers(&self, idle_for: chrono::Duration) -> Vec<WorkerId> {
        let cutoff = Utc::now() - idle_for;
        self.workers
            .values()
            .filter(|w| {
                w.state == WorkerState::Known
                    && w.occupancy == 0
                    && w.last_placement_at.unwrap_or(w.registered_at) < cutoff
            })
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn note_refresh_failure(&mut self) {
        self.consecutive_refresh_failures += 1;
        warn!(
            failures = self.consecutive_refresh_failures,
            "external registry refresh failed; retaining prior pool state"
        );
    }

    pub fn note_refresh_success(&mut self) {
        self.consecutive_refresh_failures = 0;
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let total = self.workers.len();
        let known = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Known)
            .count();
        let removed = self
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Removed)
            .count();
        let total_occupancy: u32 = self.workers.values().map(|w| w.occupancy).sum();
        let total_capacity: u32 = self.workers.values().map(|w| w.capacity).sum();

        RegistryStatistics {
            total_workers: total,
            known_workers: known,
            removed_workers: removed,
            total_occupancy,
            total_capacity,
            consecutive_refresh_failures: self.consecutive_refresh_failures,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStatistics {
    pub total_workers: usize,
    pub known_workers: usize,
    pub removed_workers: usize,
    pub total_occupancy: u32,
    pub total_capacity: u32,
    pub consecutive_refresh_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wid(s: &str) -> WorkerId {
        WorkerId(s.to_string())
    }

    #[test]
    fn register_rejects_zero_capacity() {
        let mut reg = PoolRegistry::new();
        assert!(reg.register(wid("w1"), "w1:8080".into(), 0).is_err());
    }

    #[test]
    fn register_is_idempotent_and_retains_occupancy() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 2).unwrap();
        reg.adjust_occupancy(&wid("w1"), 1).unwrap();
        reg.register(wid("w1"), "w1-new:9090".into(), 2).unwrap();
        let w = reg.get(&wid("w1")).unwrap();
        assert_eq!(w.url, "w1-new:9090");
        assert_eq!(w.occupancy, 1);
    }

    #[test]
    fn adjust_occupancy_respects_capacity() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 1).unwrap();
        reg.adjust_occupancy(&wid("w1"), 1).unwrap();
        assert!(reg.adjust_occupancy(&wid("w1"), 1).is_err());
        assert_eq!(reg.get(&wid("w1")).unwrap().occupancy, 1);
    }

    #[test]
    fn adjust_occupancy_never_goes_negative() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 2).unwrap();
        assert!(reg.adjust_occupancy(&wid("w1"), -1).is_err());
    }

    #[test]
    fn unregister_marks_removed_not_deleted() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 2).unwrap();
        reg.unregister(&wid("w1")).unwrap();
        assert_eq!(reg.get(&wid("w1")).unwrap().state, WorkerState::Removed);
    }

    #[test]
    fn refresh_removes_after_k_consecutive_misses() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 2).unwrap();
        for _ in 0..UNREACHABLE_REMOVAL_THRESHOLD {
            reg.refresh(&[]);
        }
        assert_eq!(reg.get(&wid("w1")).unwrap().state, WorkerState::Removed);
    }

    #[test]
    fn failed_refresh_never_empties_registry() {
        let mut reg = PoolRegistry::new();
        reg.register(wid("w1"), "w1:8080".into(), 2).unwrap();
        reg.note_refresh_failure();
        assert_eq!(reg.list_workers().len(), 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        // P2: occupancy never exceeds capacity, across any sequence of
        // +1/-1 adjustments. B3: a rejected +1 at capacity leaves occupancy
        // unchanged.
        proptest! {
            #[test]
            fn occupancy_never_exceeds_capacity(
                capacity in 1u32..8,
                deltas in prop::collection::vec(prop_oneof![Just(1i64), Just(-1i64)], 0..64),
            ) {
                let mut reg = PoolRegistry::new();
                reg.register(wid("w1"), "w1:8080".into(), capacity).unwrap();

                for delta in deltas {
                    let before = reg.get(&wid("w1")).unwrap().occupancy;
                    let result = reg.adjust_occupancy(&wid("w1"), delta);
                    let after = reg.get(&wid("w1")).unwrap().occupancy;

                    prop_assert!(after <= capacity);
                    if result.is_err() {
                        prop_assert_eq!(before, after, "a rejected adjustment must not change occupancy");
                    }
                }
            }
        }
    }
}
