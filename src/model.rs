//! Shared data model: identifiers, worker/agent records, lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Globally unique agent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::validation(format!("invalid agent id: {s}")))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker (agent-set) identifier, a free-form token assigned at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mission correlation identifier. Must match `[A-Za-z0-9-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MissionId(pub String);

impl MissionId {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(CoreError::validation(format!("invalid mission id: {s}")));
        }
        Ok(Self(s))
    }
}

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Known,
    Unreachable,
    Draining,
    Removed,
}

/// A registered agent-set worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub url: String,
    pub capacity: u32,
    pub occupancy: u32,
    pub state: WorkerState,
    /// Consecutive `refresh()` ticks during which this worker was absent
    /// from the external inventory. Reset to 0 whenever it reappears.
    pub consecutive_unreachable: u32,
    /// Last time `place()` successfully assigned an agent to this worker,
    /// used by the empty-set reaper's 5-minute idle check.
    pub last_placement_at: Option<DateTime<Utc>>,
    /// When this worker was first registered. Used alongside
    /// `last_placement_at` by the empty-set reaper, since a worker that has
    /// never received a placement has no `last_placement_at` to compare
    /// against.
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn has_headroom(&self) -> bool {
        self.state == WorkerState::Known && self.occupancy < self.capacity
    }
}

/// Agent lifecycle state, driven exclusively by worker status reports
/// (except Pending -> Running, which the controller triggers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LifecycleState {
    Initializing,
    Pending,
    Running,
    Paused,
    Completed,
    Error,
    Aborted,
    Unknown,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// In-memory record for a single agent, owned by the Traffic Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub mission_id: MissionId,
    pub worker_id: Option<WorkerId>,
    pub state: LifecycleState,
    pub last_updated: DateTime<Utc>,
    pub statistics: Option<serde_json::Value>,
}

impl AgentRecord {
    pub fn new(agent_id: AgentId, mission_id: MissionId, state: LifecycleState) -> Self {
        Self {
            agent_id,
            mission_id,
            worker_id: None,
            state,
            last_updated: Utc::now(),
            statistics: None,
        }
    }
}

/// Emitted by the Placement Engine when an agent is moved to a new worker
/// after its original worker was lost. Consumed by the Traffic Controller
/// to re-send the agent's state to the new worker.
#[derive(Debug, Clone, Serialize)]
pub struct RelocationEvent {
    pub agent_id: AgentId,
    pub mission_id: MissionId,
    pub old_worker_id: WorkerId,
    pub new_worker_id: WorkerId,
}

/// Validates a stored worker URL: a DNS label, or label:port, lowercase
/// letters/digits/hyphen, optional numeric port 1-65535. Schemes and paths
/// are rejected — callers add those when actually dialing out.
pub fn validate_worker_url(url: &str) -> Result<(), CoreError> {
    let (host, port) = match url.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (url, None),
    };

    let valid_host = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !host.starts_with('-')
        && !host.ends_with('-');

    let valid_port = match port {
        None => true,
        Some(p) => p.parse::<u32>().is_ok_and(|n| (1..=65535).contains(&n)),
    };

    if valid_host && valid_port {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid worker url: {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_url_validation() {
        assert!(validate_worker_url("worker-1:8080").is_ok());
        assert!(validate_worker_url("worker1").is_ok());
        assert!(validate_worker_url("http://worker-1:8080").is_err());
        assert!(validate_worker_url("worker-1:0").is_err());
        assert!(validate_worker_url("worker-1:99999").is_err());
        assert!(validate_worker_url("Worker-1").is_err());
        assert!(validate_worker_url("").is_err());
    }

    #[test]
    fn mission_id_validation() {
        assert!(MissionId::parse("mission-42").is_ok());
        assert!(MissionId::parse("mission/42").is_err());
        assert!(MissionId::parse("").is_err());
    }
}
