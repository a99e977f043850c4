//! Traffic Controller (C4) — the public surface that ties the worker pool,
//! placement engine, and dependency graph together: create, command, update,
//! forward, and report on agents.
//!
//! Grounded on the teacher's `orchestration::orchestrator::Orchestrator`
//! (the struct that owns a registry + scheduler + dag and exposes the
//! task-submission API), generalized from task scheduling to the spec's
//! agent/mission vocabulary. Locks are always taken in the fixed order
//! Registry -> Placement -> DependencyGraph -> Records, and never held
//! across an outbound worker call.

mod oracle;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::collaborators::MissionControlClient;
use crate::depgraph::DependencyGraph;
use crate::error::{CoreError, Result};
use crate::model::{AgentId, AgentRecord, LifecycleState, MissionId, RelocationEvent, WorkerId};
use crate::placement::PlacementEngine;
use crate::pool::PoolRegistry;
use crate::worker_client::WorkerClient;

pub use oracle::RecordStoreOracle;

pub type RecordStore = RwLock<HashMap<AgentId, AgentRecord>>;

/// The canonical "primary worker" placeholder (§4.2): when the registry is
/// empty or every known worker is saturated, `place_and_create` ensures this
/// entry exists and retries selection against it exactly once before
/// failing with `NoCapacity`. No process is spawned here — this assumes an
/// out-of-band deploy system will eventually materialize the real worker at
/// this URL.
#[derive(Debug, Clone)]
pub struct PrimaryWorkerConfig {
    pub worker_id: WorkerId,
    pub url: String,
    pub capacity: u32,
}

/// `MissionCommand`'s three verbs (§4.4, §6): `pauseAgents`, `abortAgents`,
/// `resumeAgents`, each fanned out per-worker rather than per-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionCommandOp {
    Pause,
    Abort,
    Resume,
}

/// A single worker's outcome within a fanned-out mission command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentCommandResult {
    pub worker_id: WorkerId,
    pub ok: bool,
    pub detail: String,
}

impl AgentCommandResult {
    fn from_worker(worker_id: WorkerId, outcome: Result<()>) -> Self {
        match outcome {
            Ok(()) => Self {
                worker_id,
                ok: true,
                detail: "ok".to_string(),
            },
            Err(e) => {
                let detail = e.to_string();
                Self {
                    worker_id,
                    ok: false,
                    detail,
                }
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MissionCommandReport {
    pub mission_id: MissionId,
    pub results: Vec<AgentCommandResult>,
}

impl MissionCommandReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }

    pub fn partial(&self) -> bool {
        !self.results.is_empty() && !self.all_succeeded()
    }
}

/// Aggregated `Statistics(missionId)` response: a total agent count, the
/// number of workers holding the mission that were contacted (regardless of
/// whether their call succeeded), a `state -> [agent summaries]` multimap,
/// and `partial` set whenever at least one worker's call failed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MissionStatistics {
    pub mission_id: MissionId,
    pub total_agents: usize,
    pub participating_workers: usize,
    pub by_state: HashMap<String, Vec<Value>>,
    pub partial: bool,
}

pub struct TrafficController {
    pool: Arc<RwLock<PoolRegistry>>,
    placement: Arc<RwLock<PlacementEngine>>,
    graph: Arc<RwLock<DependencyGraph>>,
    records: Arc<RecordStore>,
    worker_client: Arc<dyn WorkerClient>,
    mission_control: Arc<dyn MissionControlClient>,
    primary_worker: Option<PrimaryWorkerConfig>,
    /// Missions this process has observed at least one agent for, via
    /// `create_agent` or a status update. There is no reconciliation pass on
    /// startup — a fresh process starts with this empty — but
    /// `reconcile_mission` gives an operator or a future scheduled task a
    /// real rebuild path per mission (§6's "missions are supplied by the
    /// first status update" note).
    known_missions: RwLock<std::collections::HashSet<MissionId>>,
}

impl TrafficController {
    pub fn new(
        pool: Arc<RwLock<PoolRegistry>>,
        placement: Arc<RwLock<PlacementEngine>>,
        graph: Arc<RwLock<DependencyGraph>>,
        records: Arc<RecordStore>,
        worker_client: Arc<dyn WorkerClient>,
        mission_control: Arc<dyn MissionControlClient>,
    ) -> Self {
        Self::with_primary_worker(
            pool,
            placement,
            graph,
            records,
            worker_client,
            mission_control,
            None,
        )
    }

    /// As `new`, but configures the primary-bootstrap placeholder `place`
    /// falls back to when the pool is empty or saturated (§4.2).
    #[allow(clippy::too_many_arguments)]
    pub fn with_primary_worker(
        pool: Arc<RwLock<PoolRegistry>>,
        placement: Arc<RwLock<PlacementEngine>>,
        graph: Arc<RwLock<DependencyGraph>>,
        records: Arc<RecordStore>,
        worker_client: Arc<dyn WorkerClient>,
        mission_control: Arc<dyn MissionControlClient>,
        primary_worker: Option<PrimaryWorkerConfig>,
    ) -> Self {
        Self {
            pool,
            placement,
            graph,
            records,
            worker_client,
            mission_control,
            primary_worker,
            known_missions: RwLock::new(std::collections::HashSet::new()),
        }
    }

    async fn note_mission(&self, mission_id: &MissionId) {
        self.known_missions.write().await.insert(mission_id.clone());
    }

    /// Rebuilds this controller's view of `mission_id` by asking every known
    /// worker for its roster of that mission's agents and upserting a
    /// record for each one reported. Best-effort per worker, like every
    /// other fan-out; a worker that fails to answer simply contributes
    /// nothing this pass. Not run automatically on startup (§6) — exposed so
    /// an operator or a future scheduled task can trigger a rebuild.
    pub async fn reconcile_mission(&self, mission_id: &MissionId) {
        self.note_mission(mission_id).await;
        let workers = self.pool.read().await.list_workers();
        for worker in workers {
            let reported = match self
                .worker_client
                .mission_agents(&worker.url, &mission_id.0)
                .await
            {
                Ok(agents) => agents,
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, mission = %mission_id, "reconcile: worker roster call failed");
                    continue;
                }
            };
            for summary in reported {
                let Some(agent_id) = summary
                    .get("agentId")
                    .and_then(|v| v.as_str())
                    .and_then(|s| AgentId::parse(s).ok())
                else {
                    continue;
                };
                let state = summary
                    .get("state")
                    .and_then(|v| v.as_str())
                    .map(parse_state_label)
                    .unwrap_or(LifecycleState::Unknown);

                let mut records = self.records.write().await;
                records
                    .entry(agent_id)
                    .and_modify(|r| {
                        r.state = state;
                        r.worker_id = Some(worker.id.clone());
                        r.last_updated = chrono::Utc::now();
                    })
                    .or_insert_with(|| {
                        let mut record = AgentRecord::new(agent_id, mission_id.clone(), state);
                        record.worker_id = Some(worker.id.clone());
                        record
                    });
            }
        }
    }

    fn oracle(&self) -> RecordStoreOracle {
        RecordStoreOracle::new(self.records.clone())
    }

    /// Registers a new agent against a mission, optionally gated by
    /// dependencies on other agents already known to this controller. If
    /// dependencies are unmet the agent is created in `Pending` state and
    /// left unplaced; `retry_pending` will place it once satisfied.
    pub async fn create_agent(
        &self,
        mission_id: MissionId,
        depends_on: Vec<AgentId>,
        payload: Value,
    ) -> Result<AgentId> {
        let agent_id = AgentId::new();
        self.note_mission(&mission_id).await;

        {
            let mut graph = self.graph.write().await;
            graph.add_agent(agent_id);
            graph.declare(agent_id, depends_on)?;
        }

        let satisfied = {
            let graph = self.graph.read().await;
            graph.is_satisfied(&agent_id, &self.oracle()).await
        };

        let initial_state = if satisfied {
            LifecycleState::Initializing
        } else {
            LifecycleState::Pending
        };

        {
            let mut records = self.records.write().await;
            records.insert(
                agent_id,
                AgentRecord::new(agent_id, mission_id.clone(), initial_state),
            );
        }

        if satisfied {
            self.place_and_create(agent_id, &mission_id, &payload)
                .await?;
        } else {
            info!(%agent_id, %mission_id, "agent created pending unmet dependencies");
        }

        Ok(agent_id)
    }

    /// Selects a worker with headroom, reserves occupancy, records the
    /// placement, and creates the agent on that worker. On any failure after
    /// occupancy was reserved, the reservation is rolled back so a single
    /// failed create never leaks capacity.
    async fn place_and_create(
        &self,
        agent_id: AgentId,
        mission_id: &MissionId,
        payload: &Value,
    ) -> Result<WorkerId> {
        let worker_id = {
            let workers = self.pool.read().await.list_workers();
            let selected = match PlacementEngine::select_worker(&workers) {
                Some(id) => Some(id),
                None => {
                    self.ensure_primary_worker().await;
                    let workers = self.pool.read().await.list_workers();
                    PlacementEngine::select_worker(&workers)
                }
            };
            let Some(worker_id) = selected else {
                return Err(CoreError::NoCapacity);
            };
            {
                let mut pool = self.pool.write().await;
                pool.adjust_occupancy(&worker_id, 1)?;
            }
            {
                let mut placement = self.placement.write().await;
                if let Err(e) = placement.assign(agent_id, worker_id.clone()) {
                    let mut pool = self.pool.write().await;
                    let _ = pool.adjust_occupancy(&worker_id, -1);
                    return Err(e);
                }
            }
            worker_id
        };

        let worker_url = {
            let pool = self.pool.read().await;
            pool.get(&worker_id).map(|w| w.url.clone())
        };
        let Some(worker_url) = worker_url else {
            self.rollback_placement(agent_id, &worker_id).await;
            return Err(CoreError::not_found(format!(
                "worker {worker_id} vanished between selection and dispatch"
            )));
        };

        if let Err(e) = self
            .worker_client
            .create_agent(&worker_url, agent_id, payload)
            .await
        {
            warn!(%agent_id, %worker_id, error = %e, "create_agent failed, rolling back placement");
            self.rollback_placement(agent_id, &worker_id).await;
            return Err(e);
        }

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&agent_id) {
                record.worker_id = Some(worker_id.clone());
                record.state = LifecycleState::Initializing;
                record.last_updated = chrono::Utc::now();
            }
        }

        self.mission_control
            .notify_agent_state(mission_id.0.as_str(), &agent_id.to_string(), "Initializing", None)
            .await
            .ok();

        Ok(worker_id)
    }

    /// Bootstraps the configured primary-worker placeholder if it isn't
    /// already registered. Called at most once per `place_and_create`
    /// attempt, only after ordinary selection has already failed, so a
    /// healthy pool never pays for this check. A no-op if no primary worker
    /// is configured or one by that id already exists (registration is
    /// idempotent regardless, but this avoids a log line every time the
    /// pool is merely saturated rather than empty).
    async fn ensure_primary_worker(&self) {
        let Some(primary) = &self.primary_worker else {
            return;
        };
        let mut pool = self.pool.write().await;
        if pool.get(&primary.worker_id).is_some() {
            return;
        }
        match pool.register(primary.worker_id.clone(), primary.url.clone(), primary.capacity) {
            Ok(()) => info!(worker_id = %primary.worker_id, "bootstrapped primary worker placeholder"),
            Err(e) => warn!(error = %e, "failed to bootstrap primary worker placeholder"),
        }
    }

    async fn rollback_placement(&self, agent_id: AgentId, worker_id: &WorkerId) {
        let mut pool = self.pool.write().await;
        let mut placement = self.placement.write().await;
        placement.unassign(&agent_id);
        let _ = pool.adjust_occupancy(worker_id, -1);
    }

    /// Places `agent_id` if it is still `Pending` and its dependencies are
    /// now satisfied. A no-op for any other state (already placed, already
    /// terminal, or not yet satisfied). `NoCapacity` is swallowed — the
    /// agent simply stays `Pending` until a later tick or worker addition
    /// gives it somewhere to go (B1/B2 never block the caller).
    async fn try_place_if_satisfied(&self, agent_id: AgentId) {
        let Ok(record) = self.get_agent(agent_id).await else {
            return;
        };
        if record.state != LifecycleState::Pending {
            return;
        }
        let satisfied = {
            let graph = self.graph.read().await;
            graph.is_satisfied(&agent_id, &self.oracle()).await
        };
        if !satisfied {
            return;
        }
        let payload = serde_json::json!({});
        match self
            .place_and_create(agent_id, &record.mission_id, &payload)
            .await
        {
            Ok(worker_id) => {
                info!(%agent_id, %worker_id, "pending agent placed after dependencies satisfied")
            }
            Err(CoreError::NoCapacity) => {}
            Err(e) => warn!(%agent_id, error = %e, "failed to place previously-pending agent"),
        }
    }

    /// Re-evaluates every `Pending` agent in the controller, placing any
    /// whose dependencies are now satisfied. Used by `MissionCommand(resume)`,
    /// which must re-check every still-pending agent in the mission rather
    /// than just the direct dependents of one completed agent.
    pub async fn retry_pending(&self) {
        let pending: Vec<AgentId> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.state == LifecycleState::Pending)
                .map(|r| r.agent_id)
                .collect()
        };
        for agent_id in pending {
            self.try_place_if_satisfied(agent_id).await;
        }
    }

    /// Releases an agent's placement: removes it from the `PlacementMap`
    /// and gives its occupancy slot back to the worker. A no-op if the
    /// agent was never placed (e.g. it completed while still `Pending`,
    /// which cannot happen in practice but is handled defensively).
    async fn release_placement(&self, agent_id: AgentId) {
        let worker_id = {
            let mut placement = self.placement.write().await;
            placement.unassign(&agent_id)
        };
        if let Some(worker_id) = worker_id {
            let mut pool = self.pool.write().await;
            let _ = pool.adjust_occupancy(&worker_id, -1);
        }
    }

    /// Reports a lifecycle transition observed by a worker.
    ///
    /// On `Completed`/`Aborted`: releases the agent's placement (C2.release),
    /// re-checks its immediate dependents (C3.onCompleted + satisfied) and
    /// places any now-eligible ones, then purges the agent's graph node
    /// (C3.purge) — the order from §4.4. `Error` takes none of this path:
    /// the agent stays in `Error`, holding its placement, and its
    /// dependents stay `Pending` until it is manually resumed.
    pub async fn report_status(
        &self,
        agent_id: AgentId,
        state: LifecycleState,
        statistics: Option<Value>,
    ) -> Result<()> {
        let (mission_id, current_statistics) = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&agent_id)
                .ok_or_else(|| CoreError::not_found(format!("unknown agent: {agent_id}")))?;
            record.state = state;
            record.last_updated = chrono::Utc::now();
            if let Some(stats) = statistics {
                record.statistics = Some(stats);
            }
            (record.mission_id.clone(), record.statistics.clone())
        };
        self.note_mission(&mission_id).await;

        self.mission_control
            .notify_agent_state(
                mission_id.0.as_str(),
                &agent_id.to_string(),
                state_label(state),
                current_statistics.as_ref(),
            )
            .await
            .ok();

        if state.is_terminal() {
            self.release_placement(agent_id).await;

            if state == LifecycleState::Completed {
                let candidates = {
                    let graph = self.graph.read().await;
                    graph.on_completed(&agent_id)
                };
                for candidate in candidates {
                    self.try_place_if_satisfied(candidate).await;
                }
            }

            let mut graph = self.graph.write().await;
            graph.purge(&agent_id);
        }

        Ok(())
    }

    /// Non-terminal agents whose record hasn't moved in more than
    /// `staleness`, the orphan sweep's candidate set.
    pub async fn stale_agents(&self, staleness: chrono::Duration) -> Vec<AgentId> {
        let cutoff = chrono::Utc::now() - staleness;
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal() && r.last_updated < cutoff)
            .map(|r| r.agent_id)
            .collect()
    }

    /// Probes a single stale agent via its worker's `GET /agent/:id/output`
    /// and folds whatever state the worker reports back into the record.
    /// Failures are logged and otherwise swallowed — the orphan sweep is a
    /// safety net, not a source of truth on its own.
    pub async fn probe_and_refresh(&self, agent_id: AgentId) {
        let (worker_url, _) = match self.agent_worker_url(agent_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%agent_id, error = %e, "orphan sweep: agent has no placement to probe");
                return;
            }
        };

        let output = match self.worker_client.agent_output(&worker_url, agent_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%agent_id, error = %e, "orphan sweep: probe failed");
                return;
            }
        };

        let Some(state) = output.get("state").and_then(|v| v.as_str()) else {
            return;
        };
        let state = parse_state_label(state);

        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&agent_id) {
            record.state = state;
            record.last_updated = chrono::Utc::now();
        }
        drop(records);

        if state.is_terminal() {
            self.release_placement(agent_id).await;
            let mut graph = self.graph.write().await;
            graph.purge(&agent_id);
        }
    }

    /// Resumes a `Paused` agent by re-sending `/resumeAgent` to its current
    /// worker. Fails with `NotFound` if the agent has no placement, per
    /// `ResumeAgent`'s contract in §4.4.
    pub async fn resume_agent(&self, agent_id: AgentId) -> Result<()> {
        let (worker_url, state) = self.agent_worker_url(agent_id).await?;
        if state != LifecycleState::Paused {
            return Err(CoreError::conflict(format!(
                "agent {agent_id} is not paused (state: {state:?})"
            )));
        }
        self.worker_client.resume_agent(&worker_url, agent_id).await
    }

    /// `Forward(message)` — if the envelope names a target agent, looks up
    /// its worker and posts to that agent's per-agent message endpoint;
    /// unknown target is `NotFound`. With no target, the base message
    /// handling path is a bare accept: there is nowhere else in this core
    /// for an untargeted envelope to go.
    pub async fn forward(&self, target_agent_id: Option<AgentId>, message: Value) -> Result<Value> {
        let Some(agent_id) = target_agent_id else {
            return Ok(serde_json::json!({ "accepted": true }));
        };
        let (worker_url, _) = self.agent_worker_url(agent_id).await?;
        self.worker_client
            .message_agent(&worker_url, agent_id, &message)
            .await
    }

    pub async fn list_workers(&self) -> Vec<crate::model::Worker> {
        self.pool.read().await.list_workers()
    }

    /// Removes a worker from the pool and immediately relocates whatever was
    /// placed on it, combining `PoolRegistry::unregister` with the same
    /// relocation path the background refresh loop uses so callers never
    /// observe a worker marked removed with agents still assigned to it.
    pub async fn unregister_worker(&self, worker_id: &WorkerId) -> Result<Vec<RelocationEvent>> {
        {
            let mut pool = self.pool.write().await;
            pool.unregister(worker_id)?;
        }
        Ok(self.relocate_stranded(worker_id).await)
    }

    /// The set of workers currently holding at least one non-terminal agent
    /// for `mission_id`, used by every mission-wide fan-out (`MissionCommand`,
    /// `Statistics`, `Roster`) so each worker is contacted exactly once
    /// regardless of how many of the mission's agents it holds.
    async fn workers_for_mission(&self, mission_id: &MissionId) -> Vec<(WorkerId, String)> {
        let worker_ids: std::collections::HashSet<WorkerId> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| &r.mission_id == mission_id)
                .filter_map(|r| r.worker_id.clone())
                .collect()
        };
        let pool = self.pool.read().await;
        worker_ids
            .into_iter()
            .filter_map(|id| pool.get(&id).map(|w| (id, w.url.clone())))
            .collect()
    }

    /// Fans `op` out to every worker holding agents for `mission_id`, each
    /// call carrying only the mission id (§4.4). A per-worker failure never
    /// aborts the others; the aggregate is reported back via
    /// `MissionCommandReport::all_succeeded`/`partial`.
    ///
    /// `Abort` additionally releases the placement of every agent the
    /// worker reports as terminated, and purges its graph node — mirroring
    /// the terminal-state cleanup `report_status` performs for a single
    /// agent. `Pause` never touches placement. `Resume` re-evaluates every
    /// still-`Pending` agent in the mission afterwards.
    pub async fn mission_command(
        &self,
        mission_id: MissionId,
        op: MissionCommandOp,
    ) -> Result<MissionCommandReport> {
        let workers = self.workers_for_mission(&mission_id).await;

        let mut results = Vec::with_capacity(workers.len());
        for (worker_id, worker_url) in workers {
            match op {
                MissionCommandOp::Pause => {
                    let outcome = self.worker_client.pause_agents(&worker_url, &mission_id.0).await;
                    results.push(AgentCommandResult::from_worker(worker_id, outcome));
                }
                MissionCommandOp::Resume => {
                    let outcome = self.worker_client.resume_agents(&worker_url, &mission_id.0).await;
                    results.push(AgentCommandResult::from_worker(worker_id, outcome));
                }
                MissionCommandOp::Abort => {
                    match self.worker_client.abort_agents(&worker_url, &mission_id.0).await {
                        Ok(terminated) => {
                            for agent_id in terminated {
                                self.release_placement(agent_id).await;
                                let mut records = self.records.write().await;
                                if let Some(r) = records.get_mut(&agent_id) {
                                    r.state = LifecycleState::Aborted;
                                    r.last_updated = chrono::Utc::now();
                                }
                                drop(records);
                                let mut graph = self.graph.write().await;
                                graph.purge(&agent_id);
                            }
                            results.push(AgentCommandResult {
                                worker_id,
                                ok: true,
                                detail: "ok".to_string(),
                            });
                        }
                        Err(e) => results.push(AgentCommandResult {
                            worker_id,
                            ok: false,
                            detail: e.to_string(),
                        }),
                    }
                }
            }
        }

        if op == MissionCommandOp::Resume {
            self.retry_pending().await;
        }

        Ok(MissionCommandReport {
            mission_id,
            results,
        })
    }

    /// `Statistics(missionId)` — fans out to every worker holding agents for
    /// the mission, aggregating into a total agent count, the number of
    /// participating workers, and a `state -> [agent summaries]` multimap.
    /// A failing worker contributes zero agents and is logged, never fails
    /// the whole call; `partial` is set whenever any worker failed.
    pub async fn statistics(&self, mission_id: &MissionId) -> MissionStatistics {
        let workers = self.workers_for_mission(mission_id).await;
        let mut by_state: HashMap<String, Vec<Value>> = HashMap::new();
        let mut total_agents = 0usize;
        let mut partial = false;
        let participating_workers = workers.len();

        for (worker_id, worker_url) in workers {
            match self.worker_client.statistics(&worker_url, &mission_id.0).await {
                Ok(Value::Object(map)) => {
                    if let Some(Value::Object(states)) = map.get("byState") {
                        for (state, agents) in states {
                            let agents = agents.as_array().cloned().unwrap_or_default();
                            total_agents += agents.len();
                            by_state.entry(state.clone()).or_default().extend(agents);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%worker_id, error = %e, mission = %mission_id, "worker statistics call failed, contributing zero agents");
                    partial = true;
                }
            }
        }

        MissionStatistics {
            mission_id: mission_id.clone(),
            total_agents,
            participating_workers,
            by_state,
            partial,
        }
    }

    /// `Roster(missionId)` — the flat concatenation of worker-reported
    /// agent records for the mission (§4.4), fanned out one call per
    /// participating worker.
    pub async fn roster(&self, mission_id: &MissionId) -> Vec<Value> {
        let workers = self.workers_for_mission(mission_id).await;
        let mut out = Vec::new();
        for (worker_id, worker_url) in workers {
            match self.worker_client.mission_agents(&worker_url, &mission_id.0).await {
                Ok(agents) => out.extend(agents),
                Err(e) => warn!(%worker_id, error = %e, mission = %mission_id, "worker roster call failed"),
            }
        }
        out
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<AgentRecord> {
        self.records
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("unknown agent: {agent_id}")))
    }

    async fn agent_worker_url(&self, agent_id: AgentId) -> Result<(String, LifecycleState)> {
        let record = self.get_agent(agent_id).await?;
        let worker_id = record
            .worker_id
            .ok_or_else(|| CoreError::not_found(format!("agent {agent_id} has no placement")))?;
        let pool = self.pool.read().await;
        let url = pool
            .get(&worker_id)
            .map(|w| w.url.clone())
            .ok_or_else(|| CoreError::not_found(format!("unknown worker: {worker_id}")))?;
        Ok((url, record.state))
    }

    /// `GetAgentLocation(agentId)` — the URL of the worker currently holding
    /// `agent_id`, or `NotFound` if it has none (unknown agent or unplaced).
    pub async fn locate(&self, agent_id: AgentId) -> Result<String> {
        Ok(self.agent_worker_url(agent_id).await?.0)
    }

    /// `UpdateAgentLocation(agentId, workerUrl)` — an administrative
    /// correction used by a worker to report where it has actually placed an
    /// agent, overriding this controller's `PlacementMap` entry without
    /// touching occupancy counters (the worker is reporting a fact about
    /// itself, not requesting a new reservation).
    pub async fn update_agent_location(&self, agent_id: AgentId, worker_url: &str) -> Result<()> {
        let worker_id = {
            let pool = self.pool.read().await;
            pool.list_workers()
                .into_iter()
                .find(|w| w.url == worker_url)
                .map(|w| w.id)
                .ok_or_else(|| CoreError::not_found(format!("unknown worker url: {worker_url}")))?
        };
        {
            let mut placement = self.placement.write().await;
            placement.reassign(agent_id, worker_id.clone());
        }
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&agent_id) {
            record.worker_id = Some(worker_id);
            record.last_updated = chrono::Utc::now();
        }
        Ok(())
    }

    /// `CheckBlockedAgents(completedAgentId)` — an external poke to
    /// re-evaluate `completed_agent_id`'s dependents, for a caller that
    /// already knows an agent completed and wants its blocked dependents
    /// re-checked without going through `report_status` again (e.g. after a
    /// reconciliation pass populated records directly).
    pub async fn check_blocked_agents(&self, completed_agent_id: AgentId) {
        let candidates = {
            let graph = self.graph.read().await;
            graph.on_completed(&completed_agent_id)
        };
        for candidate in candidates {
            self.try_place_if_satisfied(candidate).await;
        }
    }

    /// `DependentAgents(agentId)` — the agents directly depending on
    /// `agent_id`, per the dependency graph's reverse index.
    pub async fn dependents_of(&self, agent_id: AgentId) -> Vec<AgentId> {
        self.graph.read().await.dependents_of(&agent_id)
    }

    /// Relocates every agent stranded on a worker that was just removed from
    /// the pool, re-creating each on a newly selected worker. Agents for
    /// which no worker has headroom are left unplaced (marked `Pending`)
    /// rather than failing the whole sweep.
    pub async fn relocate_stranded(&self, old_worker_id: &WorkerId) -> Vec<RelocationEvent> {
        let stranded = {
            let placement = self.placement.read().await;
            placement.agents_on(old_worker_id)
        };
        if stranded.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        for agent_id in stranded {
            let record = match self.get_agent(agent_id).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            if record.state.is_terminal() {
                continue;
            }

            let new_worker_id = {
                let workers = self.pool.read().await.list_workers();
                PlacementEngine::select_worker(&workers)
            };

            let Some(new_worker_id) = new_worker_id else {
                {
                    let mut records = self.records.write().await;
                    if let Some(r) = records.get_mut(&agent_id) {
                        r.state = LifecycleState::Pending;
                        r.worker_id = None;
                    }
                }
                {
                    let mut placement = self.placement.write().await;
                    placement.unassign(&agent_id);
                }
                {
                    let mut pool = self.pool.write().await;
                    let _ = pool.adjust_occupancy(old_worker_id, -1);
                }
                warn!(%agent_id, %old_worker_id, "no capacity to relocate stranded agent, marked pending");
                continue;
            };

            {
                let mut pool = self.pool.write().await;
                if pool.adjust_occupancy(&new_worker_id, 1).is_err() {
                    continue;
                }
                // §4.2: transfer occupancy atomically, new worker up then old worker down.
                let _ = pool.adjust_occupancy(old_worker_id, -1);
            }
            {
                let mut placement = self.placement.write().await;
                placement.reassign(agent_id, new_worker_id.clone());
            }

            let worker_url = {
                let pool = self.pool.read().await;
                pool.get(&new_worker_id).map(|w| w.url.clone())
            };
            if let Some(worker_url) = worker_url {
                let payload = serde_json::json!({ "relocated_from": old_worker_id.to_string() });
                if let Err(e) = self
                    .worker_client
                    .create_agent(&worker_url, agent_id, &payload)
                    .await
                {
                    warn!(%agent_id, %new_worker_id, error = %e, "failed to re-create relocated agent");
                    continue;
                }
            }

            {
                let mut records = self.records.write().await;
                if let Some(r) = records.get_mut(&agent_id) {
                    r.worker_id = Some(new_worker_id.clone());
                    r.state = LifecycleState::Initializing;
                    r.last_updated = chrono::Utc::now();
                }
            }

            events.push(RelocationEvent {
                agent_id,
                mission_id: record.mission_id.clone(),
                old_worker_id: old_worker_id.clone(),
                new_worker_id,
            });
        }

        events
    }
}

fn state_label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Initializing => "Initializing",
        LifecycleState::Pending => "Pending",
        LifecycleState::Running => "Running",
        LifecycleState::Paused => "Paused",
        LifecycleState::Completed => "Completed",
        LifecycleState::Error => "Error",
        LifecycleState::Aborted => "Aborted",
        LifecycleState::Unknown => "Unknown",
    }
}

fn parse_state_label(s: &str) -> LifecycleState {
    match s {
        "Initializing" => LifecycleState::Initializing,
        "Pending" => LifecycleState::Pending,
        "Running" => LifecycleState::Running,
        "Paused" => LifecycleState::Paused,
        "Completed" => LifecycleState::Completed,
        "Error" => LifecycleState::Error,
        "Aborted" => LifecycleState::Aborted,
        _ => LifecycleState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MissionControlClient;
    use crate::worker_client::WorkerClient;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubWorkerClient {
        creates: AtomicUsize,
        fail_next_create: std::sync::atomic::AtomicBool,
    }

    impl StubWorkerClient {
        fn new() -> Self {
            Self {
                creates: AtomicUsize::new(0),
                fail_next_create: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl WorkerClient for StubWorkerClient {
        async fn create_agent(
            &self,
            _worker_url: &str,
            _agent_id: AgentId,
            _payload: &Value,
        ) -> Result<()> {
            if self.fail_next_create.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Unreachable("boom".into()));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pause_agents(&self, _worker_url: &str, _mission_id: &str) -> Result<()> {
            Ok(())
        }

        async fn abort_agents(&self, _worker_url: &str, _mission_id: &str) -> Result<Vec<AgentId>> {
            Ok(Vec::new())
        }

        async fn resume_agents(&self, _worker_url: &str, _mission_id: &str) -> Result<()> {
            Ok(())
        }

        async fn resume_agent(&self, _worker_url: &str, _agent_id: AgentId) -> Result<()> {
            Ok(())
        }

        async fn message_agent(
            &self,
            _worker_url: &str,
            _agent_id: AgentId,
            _envelope: &Value,
        ) -> Result<Value> {
            Ok(serde_json::json!({"ack": true}))
        }

        async fn agent_output(&self, _worker_url: &str, _agent_id: AgentId) -> Result<Value> {
            Ok(serde_json::json!({}))
        }

        async fn mission_agents(&self, _worker_url: &str, _mission_id: &str) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn statistics(&self, _worker_url: &str, _mission_id: &str) -> Result<Value> {
            Ok(serde_json::json!({"byState": {}}))
        }
    }

    struct NoopMissionControl;

    #[async_trait]
    impl MissionControlClient for NoopMissionControl {
        async fn notify_agent_state(
            &self,
            _mission_id: &str,
            _agent_id: &str,
            _status: &str,
            _statistics: Option<&Value>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn controller_with_one_worker(capacity: u32) -> (TrafficController, Arc<StubWorkerClient>) {
        let mut pool = PoolRegistry::new();
        pool.register(WorkerId("w1".into()), "w1:8080".into(), capacity)
            .unwrap();
        let worker_client = Arc::new(StubWorkerClient::new());
        let controller = TrafficController::new(
            Arc::new(RwLock::new(pool)),
            Arc::new(RwLock::new(PlacementEngine::new())),
            Arc::new(RwLock::new(DependencyGraph::new())),
            Arc::new(RwLock::new(HashMap::new())),
            worker_client.clone(),
            Arc::new(NoopMissionControl),
        );
        (controller, worker_client)
    }

    #[tokio::test]
    async fn create_agent_places_immediately_without_dependencies() {
        let (controller, worker_client) = controller_with_one_worker(2);
        let mission = MissionId("m1".into());
        let agent_id = controller
            .create_agent(mission, vec![], serde_json::json!({}))
            .await
            .unwrap();

        let record = controller.get_agent(agent_id).await.unwrap();
        assert_eq!(record.state, LifecycleState::Initializing);
        assert!(record.worker_id.is_some());
        assert_eq!(worker_client.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_agent_stays_pending_until_dependency_completes() {
        let (controller, _) = controller_with_one_worker(2);
        let mission = MissionId("m1".into());
        let dep = controller
            .create_agent(mission.clone(), vec![], serde_json::json!({}))
            .await
            .unwrap();
        let dependent = controller
            .create_agent(mission, vec![dep], serde_json::json!({}))
            .await
            .unwrap();

        let record = controller.get_agent(dependent).await.unwrap();
        assert_eq!(record.state, LifecycleState::Pending);

        controller
            .report_status(dep, LifecycleState::Completed, None)
            .await
            .unwrap();

        let record = controller.get_agent(dependent).await.unwrap();
        assert_eq!(record.state, LifecycleState::Initializing);
    }

    #[tokio::test]
    async fn create_agent_fails_with_no_capacity_when_pool_full() {
        let (controller, _) = controller_with_one_worker(1);
        let mut pool_guard = controller.pool.write().await;
        pool_guard.unregister(&WorkerId("w1".into())).unwrap();
        drop(pool_guard);

        let err = controller
            .create_agent(MissionId("m1".into()), vec![], serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoCapacity));
    }

    #[tokio::test]
    async fn place_bootstraps_primary_worker_when_pool_empty() {
        let worker_client = Arc::new(StubWorkerClient::new());
        let controller = TrafficController::with_primary_worker(
            Arc::new(RwLock::new(PoolRegistry::new())),
            Arc::new(RwLock::new(PlacementEngine::new())),
            Arc::new(RwLock::new(DependencyGraph::new())),
            Arc::new(RwLock::new(HashMap::new())),
            worker_client.clone(),
            Arc::new(NoopMissionControl),
            Some(PrimaryWorkerConfig {
                worker_id: WorkerId("primary".into()),
                url: "primary:8080".into(),
                capacity: 5,
            }),
        );

        let agent_id = controller
            .create_agent(MissionId("m1".into()), vec![], serde_json::json!({}))
            .await
            .unwrap();

        let record = controller.get_agent(agent_id).await.unwrap();
        assert_eq!(record.worker_id, Some(WorkerId("primary".into())));
        assert_eq!(worker_client.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn place_without_primary_worker_configured_fails_no_capacity_on_empty_pool() {
        let (controller, _) = controller_with_one_worker(1);
        {
            let mut pool = controller.pool.write().await;
            pool.unregister(&WorkerId("w1".into())).unwrap();
        }
        let err = controller
            .create_agent(MissionId("m1".into()), vec![], serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoCapacity));
    }

    #[tokio::test]
    async fn mission_command_fans_out_once_per_worker() {
        let (controller, _) = controller_with_one_worker(2);
        let mission = MissionId("m1".into());
        controller
            .create_agent(mission.clone(), vec![], serde_json::json!({}))
            .await
            .unwrap();

        let report = controller
            .mission_command(mission, MissionCommandOp::Pause)
            .await
            .unwrap();
        assert!(report.all_succeeded());
        assert_eq!(report.results.len(), 1, "one worker holds the mission's only agent");
    }

    #[tokio::test]
    async fn relocate_stranded_moves_agent_to_new_worker() {
        let (controller, _) = controller_with_one_worker(2);
        {
            let mut pool = controller.pool.write().await;
            pool.register(WorkerId("w2".into()), "w2:8080".into(), 2)
                .unwrap();
        }
        let mission = MissionId("m1".into());
        let agent_id = controller
            .create_agent(mission, vec![], serde_json::json!({}))
            .await
            .unwrap();

        {
            let mut pool = controller.pool.write().await;
            pool.unregister(&WorkerId("w1".into())).unwrap();
        }

        let events = controller.relocate_stranded(&WorkerId("w1".into())).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, agent_id);
        assert_eq!(events[0].new_worker_id, WorkerId("w2".into()));
    }
}
