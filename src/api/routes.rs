//! Route handlers and the shared application state, grounded on the
//! teacher's `commands::api::routes` (one `AppState`, one `create_routes`
//! entry point, handlers that extract `State` and return `Json<T>` or
//! `Result<Json<T>, ApiError>`). Paths and bodies match the control plane's
//! external HTTP surface literally: distinct endpoints per verb rather than
//! a generic REST resource shape, since external callers (workers, mission
//! control) are written against these exact names.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::controller::{AgentCommandResult, MissionCommandOp, MissionStatistics, TrafficController};
use crate::error::{CoreError, Result};
use crate::model::{AgentId, LifecycleState, MissionId};
use crate::pool::{PoolRegistry, RegistryStatistics};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TrafficController>,
    pub pool: Arc<RwLock<PoolRegistry>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}

// --- Ambient operator surface, not named by the external contract but
// needed to inspect/drain the pool in practice. ---

async fn registry_statistics(State(state): State<AppState>) -> Json<RegistryStatistics> {
    Json(state.pool.read().await.statistics())
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<crate::model::Worker>> {
    Json(state.pool.read().await.list_workers())
}

async fn unregister_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<Vec<crate::model::RelocationEvent>>> {
    let events = state
        .controller
        .unregister_worker(&crate::model::WorkerId(worker_id))
        .await?;
    Ok(Json(events))
}

// --- POST /message ---

#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    #[serde(default, rename = "forAgent")]
    pub for_agent: Option<String>,
    pub content: serde_json::Value,
}

async fn message(
    State(state): State<AppState>,
    Json(envelope): Json<MessageEnvelope>,
) -> Result<Json<serde_json::Value>> {
    let target = envelope
        .for_agent
        .as_deref()
        .map(AgentId::parse)
        .transpose()?;
    let body = serde_json::json!({
        "type": envelope.kind,
        "sender": envelope.sender,
        "content": envelope.content,
    });
    Ok(Json(state.controller.forward(target, body).await?))
}

// --- POST /createAgent ---

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(rename = "actionVerb")]
    pub action_verb: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(rename = "missionId")]
    pub mission_id: String,
    #[serde(default, rename = "missionContext")]
    pub mission_context: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateAgentResponse {
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
    pub pending: bool,
}

async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<Json<CreateAgentResponse>> {
    let mission_id = MissionId::parse(req.mission_id)?;
    let depends_on = req
        .dependencies
        .iter()
        .map(|s| AgentId::parse(s))
        .collect::<Result<Vec<_>>>()?;
    let payload = serde_json::json!({
        "actionVerb": req.action_verb,
        "inputs": req.inputs,
        "missionContext": req.mission_context,
    });

    let agent_id = state
        .controller
        .create_agent(mission_id, depends_on, payload)
        .await?;
    let pending = state.controller.get_agent(agent_id).await?.state == LifecycleState::Pending;

    Ok(Json(CreateAgentResponse { agent_id, pending }))
}

// --- POST /pauseAgents, /abortAgents, /resumeAgents ---

#[derive(Debug, Deserialize)]
pub struct MissionIdRequest {
    #[serde(rename = "missionId")]
    pub mission_id: String,
}

#[derive(Debug, Serialize)]
pub struct MissionCommandResponse {
    pub partial: bool,
    #[serde(rename = "perWorker")]
    pub per_worker: Vec<AgentCommandResult>,
}

async fn run_mission_command(
    state: &AppState,
    mission_id: String,
    op: MissionCommandOp,
) -> Result<Json<MissionCommandResponse>> {
    let mission_id = MissionId::parse(mission_id)?;
    let report = state.controller.mission_command(mission_id, op).await?;
    Ok(Json(MissionCommandResponse {
        partial: report.partial(),
        per_worker: report.results,
    }))
}

async fn pause_agents(
    State(state): State<AppState>,
    Json(req): Json<MissionIdRequest>,
) -> Result<Json<MissionCommandResponse>> {
    run_mission_command(&state, req.mission_id, MissionCommandOp::Pause).await
}

async fn abort_agents(
    State(state): State<AppState>,
    Json(req): Json<MissionIdRequest>,
) -> Result<Json<MissionCommandResponse>> {
    run_mission_command(&state, req.mission_id, MissionCommandOp::Abort).await
}

async fn resume_agents(
    State(state): State<AppState>,
    Json(req): Json<MissionIdRequest>,
) -> Result<Json<MissionCommandResponse>> {
    run_mission_command(&state, req.mission_id, MissionCommandOp::Resume).await
}

// --- POST /resumeAgent ---

#[derive(Debug, Deserialize)]
pub struct ResumeAgentRequest {
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

async fn resume_agent(
    State(state): State<AppState>,
    Json(req): Json<ResumeAgentRequest>,
) -> Result<Json<()>> {
    let agent_id = AgentId::parse(&req.agent_id)?;
    state.controller.resume_agent(agent_id).await?;
    Ok(Json(()))
}

// --- GET /getAgentStatistics/:missionId ---

async fn get_agent_statistics(
    State(state): State<AppState>,
    Path(mission_id): Path<String>,
) -> Result<Json<MissionStatistics>> {
    let mission_id = MissionId::parse(mission_id)?;
    Ok(Json(state.controller.statistics(&mission_id).await))
}

// --- GET /mission/:missionId/roster ---

async fn roster(
    State(state): State<AppState>,
    Path(mission_id): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>> {
    let mission_id = MissionId::parse(mission_id)?;
    Ok(Json(state.controller.roster(&mission_id).await))
}

// --- GET /getAgentLocation/:agentId ---

#[derive(Debug, Serialize)]
pub struct AgentLocationResponse {
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
    #[serde(rename = "workerUrl")]
    pub worker_url: String,
}

async fn get_agent_location(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AgentLocationResponse>> {
    let agent_id = AgentId::parse(&id.to_string())?;
    let worker_url = state.controller.locate(agent_id).await?;
    Ok(Json(AgentLocationResponse {
        agent_id,
        worker_url,
    }))
}

// --- POST /updateAgentLocation ---

#[derive(Debug, Deserialize)]
pub struct UpdateAgentLocationRequest {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "workerUrl")]
    pub worker_url: String,
}

async fn update_agent_location(
    State(state): State<AppState>,
    Json(req): Json<UpdateAgentLocationRequest>,
) -> Result<Json<()>> {
    let agent_id = AgentId::parse(&req.agent_id)?;
    state
        .controller
        .update_agent_location(agent_id, &req.worker_url)
        .await?;
    Ok(Json(()))
}

// --- POST /agentStatisticsUpdate ---

#[derive(Debug, Deserialize)]
pub struct AgentStatisticsUpdateRequest {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "missionId")]
    pub mission_id: String,
    pub status: LifecycleState,
    #[serde(default)]
    pub statistics: Option<serde_json::Value>,
}

async fn agent_statistics_update(
    State(state): State<AppState>,
    Json(req): Json<AgentStatisticsUpdateRequest>,
) -> Result<Json<()>> {
    let agent_id = AgentId::parse(&req.agent_id)?;
    let mission_id = MissionId::parse(req.mission_id)?;
    let record = state.controller.get_agent(agent_id).await?;
    if record.mission_id != mission_id {
        return Err(CoreError::conflict(format!(
            "agent {agent_id} does not belong to mission {mission_id}"
        )));
    }
    state
        .controller
        .report_status(agent_id, req.status, req.statistics)
        .await?;
    Ok(Json(()))
}

// --- POST /checkBlockedAgents ---

#[derive(Debug, Deserialize)]
pub struct CheckBlockedAgentsRequest {
    #[serde(rename = "completedAgentId")]
    pub completed_agent_id: String,
}

async fn check_blocked_agents(
    State(state): State<AppState>,
    Json(req): Json<CheckBlockedAgentsRequest>,
) -> Result<Json<()>> {
    let agent_id = AgentId::parse(&req.completed_agent_id)?;
    state.controller.check_blocked_agents(agent_id).await;
    Ok(Json(()))
}

// --- GET /dependentAgents/:agentId ---

async fn dependent_agents(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AgentId>>> {
    let agent_id = AgentId::parse(&id.to_string())?;
    Ok(Json(state.controller.dependents_of(agent_id).await))
}

/// The one route reachable without a bearer token, so liveness probes don't
/// need a credential.
pub fn health_route(state: AppState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Everything else. Mounted behind the bearer-auth middleware in
/// `api::server::build_router`. Paths mirror the external contract exactly;
/// the `/stats`, `/workers` ambient routes are the one addition beyond it.
pub fn protected_routes(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(registry_statistics))
        .route("/workers", get(list_workers))
        .route("/workers/{id}", delete(unregister_worker))
        .route("/message", post(message))
        .route("/createAgent", post(create_agent))
        .route("/pauseAgents", post(pause_agents))
        .route("/abortAgents", post(abort_agents))
        .route("/resumeAgents", post(resume_agents))
        .route("/resumeAgent", post(resume_agent))
        .route("/getAgentStatistics/{mission_id}", get(get_agent_statistics))
        .route("/mission/{mission_id}/roster", get(roster))
        .route("/getAgentLocation/{id}", get(get_agent_location))
        .route("/updateAgentLocation", post(update_agent_location))
        .route("/agentStatisticsUpdate", post(agent_statistics_update))
        .route("/checkBlockedAgents", post(check_blocked_agents))
        .route("/dependentAgents/{id}", get(dependent_agents))
        .with_state(state)
}
