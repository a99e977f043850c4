//! Outbound HTTP client to agent-set workers.
//!
//! Grounded on the teacher's `commands::api::auth_proxy::AuthProxyState`
//! (a `reqwest::Client` built once and shared behind an `Arc`, issuing
//! per-request calls against a per-instance base URL), generalized from a
//! single fixed proxy target to per-call target workers. Endpoint paths and
//! request/response shapes follow the worker contract in §6: `/addAgent`,
//! `/pauseAgents`, `/abortAgents`, `/resumeAgents`, `/resumeAgent`,
//! `/message`, `/agent/:id/message`, `/agent/:id/output`,
//! `/mission/:id/agents`, `/statistics?missionId=`.
//!
//! Retry policy (§7): only `create_agent` retries, and only once, and only
//! on the `NetworkTimeout` failure class (`reqwest::Error::is_timeout`).
//! Every other call — including the three mission-command verbs — makes a
//! single attempt; a fan-out's partial-failure reporting is how the spec
//! wants worker unavailability surfaced, not client-side retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::AgentId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request deadline for calls made as part of a mission-wide fan-out
/// (`pauseAgents`/`abortAgents`/`resumeAgents`, `statistics`, the roster's
/// `mission/:id/agents`), per §5's "30 s for fan-out" vs the client's 10 s
/// unary default.
const FANOUT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the Traffic Controller needs to talk to an agent-set worker.
/// Abstracted as a trait so controller tests can stub worker responses
/// without binding a real listener.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// `POST /addAgent` — places a new agent on this worker.
    async fn create_agent(&self, worker_url: &str, agent_id: AgentId, payload: &Value)
    -> Result<()>;

    /// `POST /pauseAgents` `{missionId}` — pause every agent this worker
    /// holds for the mission. Placement is unaffected either way.
    async fn pause_agents(&self, worker_url: &str, mission_id: &str) -> Result<()>;

    /// `POST /abortAgents` `{missionId}` — abort every agent this worker
    /// holds for the mission. Returns the agent ids the worker reports as
    /// terminated, so the caller can release their placements (§4.4).
    async fn abort_agents(&self, worker_url: &str, mission_id: &str) -> Result<Vec<AgentId>>;

    /// `POST /resumeAgents` `{missionId}` — resume every `Paused` agent
    /// this worker holds for the mission.
    async fn resume_agents(&self, worker_url: &str, mission_id: &str) -> Result<()>;

    /// `POST /resumeAgent` `{agentId}` — resume a single agent, used both
    /// for `ResumeAgent` and for unblocking a dependent once its
    /// prerequisites are satisfied.
    async fn resume_agent(&self, worker_url: &str, agent_id: AgentId) -> Result<()>;

    /// `POST /agent/:id/message` — forwards an envelope addressed to a
    /// specific agent.
    async fn message_agent(&self, worker_url: &str, agent_id: AgentId, envelope: &Value)
    -> Result<Value>;

    /// `GET /agent/:id/output` — probes an agent's current output/state
    /// directly, used by the orphan sweep to refresh a stale record without
    /// waiting for the worker to push a status update.
    async fn agent_output(&self, worker_url: &str, agent_id: AgentId) -> Result<Value>;

    /// `GET /mission/:id/agents` — the worker's own view of the agents it
    /// holds for a mission, used to build `Roster`.
    async fn mission_agents(&self, worker_url: &str, mission_id: &str) -> Result<Vec<Value>>;

    /// `GET /statistics?missionId=` — the worker's per-mission agent
    /// summaries, used to build `Statistics`.
    async fn statistics(&self, worker_url: &str, mission_id: &str) -> Result<Value>;
}

#[derive(Debug, Deserialize, Default)]
struct AbortAgentsResponse {
    #[serde(default)]
    terminated: Vec<String>,
}

/// `reqwest`-backed `WorkerClient`, shared across the process behind an
/// `Arc` the same way the teacher shares its proxy client.
#[derive(Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build worker HTTP client");
        Self { client }
    }

    fn endpoint(worker_url: &str, path: &str) -> String {
        format!("http://{worker_url}{path}")
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Unreachable(format!("worker unreachable at {url}: {e}")))?;
        Self::decode(url, resp).await
    }

    /// As `post`, but carries the fan-out deadline instead of the client's
    /// unary default, overriding it per-request via `RequestBuilder::timeout`.
    async fn post_fanout(&self, url: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .timeout(FANOUT_REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Unreachable(format!("worker unreachable at {url}: {e}")))?;
        Self::decode(url, resp).await
    }

    /// `create_agent` is the sole call with a retry: one attempt, one retry,
    /// only on a timeout-class transport failure.
    async fn post_with_one_retry(&self, url: &str, body: &Value) -> Result<Value> {
        match self.client.post(url).json(body).send().await {
            Ok(resp) => Self::decode(url, resp).await,
            Err(e) if e.is_timeout() => {
                debug!(url, "create_agent timed out, retrying once");
                let resp = self
                    .client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| CoreError::Unreachable(format!("worker unreachable at {url}: {e}")))?;
                Self::decode(url, resp).await
            }
            Err(e) => Err(CoreError::Unreachable(format!(
                "worker unreachable at {url}: {e}"
            ))),
        }
    }

    /// GETs are idempotent, so a single transport-level retry is safe
    /// regardless of failure class (§7) — unlike `create_agent`'s POST,
    /// which only retries on a timeout specifically.
    async fn get(&self, url: &str) -> Result<Value> {
        match self.client.get(url).send().await {
            Ok(resp) => Self::decode(url, resp).await,
            Err(e) => {
                debug!(url, error = %e, "GET failed, retrying once");
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| CoreError::Unreachable(format!("worker unreachable at {url}: {e}")))?;
                Self::decode(url, resp).await
            }
        }
    }

    /// As `get`, but carries the fan-out deadline on both the initial
    /// attempt and its retry.
    async fn get_fanout(&self, url: &str) -> Result<Value> {
        match self.client.get(url).timeout(FANOUT_REQUEST_TIMEOUT).send().await {
            Ok(resp) => Self::decode(url, resp).await,
            Err(e) => {
                debug!(url, error = %e, "GET failed, retrying once");
                let resp = self
                    .client
                    .get(url)
                    .timeout(FANOUT_REQUEST_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| CoreError::Unreachable(format!("worker unreachable at {url}: {e}")))?;
                Self::decode(url, resp).await
            }
        }
    }

    async fn decode(url: &str, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::Unreachable(format!(
                "worker at {url} responded {status}: {text}"
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| CoreError::Internal(e.into()))
    }
}

impl Default for HttpWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn create_agent(
        &self,
        worker_url: &str,
        agent_id: AgentId,
        payload: &Value,
    ) -> Result<()> {
        let url = Self::endpoint(worker_url, "/addAgent");
        let mut body = payload.clone();
        if let Value::Object(ref mut map) = body {
            map.insert("agentId".into(), Value::String(agent_id.to_string()));
        }
        debug!(url, %agent_id, "creating agent on worker");
        self.post_with_one_retry(&url, &body).await?;
        Ok(())
    }

    async fn pause_agents(&self, worker_url: &str, mission_id: &str) -> Result<()> {
        let url = Self::endpoint(worker_url, "/pauseAgents");
        self.post_fanout(&url, &serde_json::json!({ "missionId": mission_id }))
            .await?;
        Ok(())
    }

    async fn abort_agents(&self, worker_url: &str, mission_id: &str) -> Result<Vec<AgentId>> {
        let url = Self::endpoint(worker_url, "/abortAgents");
        let body = self
            .post_fanout(&url, &serde_json::json!({ "missionId": mission_id }))
            .await?;
        let parsed: AbortAgentsResponse =
            serde_json::from_value(body).unwrap_or_default();
        Ok(parsed
            .terminated
            .into_iter()
            .filter_map(|s| AgentId::parse(&s).ok())
            .collect())
    }

    async fn resume_agents(&self, worker_url: &str, mission_id: &str) -> Result<()> {
        let url = Self::endpoint(worker_url, "/resumeAgents");
        self.post_fanout(&url, &serde_json::json!({ "missionId": mission_id }))
            .await?;
        Ok(())
    }

    async fn resume_agent(&self, worker_url: &str, agent_id: AgentId) -> Result<()> {
        let url = Self::endpoint(worker_url, "/resumeAgent");
        self.post(&url, &serde_json::json!({ "agentId": agent_id.to_string() }))
            .await?;
        Ok(())
    }

    async fn message_agent(
        &self,
        worker_url: &str,
        agent_id: AgentId,
        envelope: &Value,
    ) -> Result<Value> {
        let url = Self::endpoint(worker_url, &format!("/agent/{agent_id}/message"));
        self.post(&url, envelope).await
    }

    async fn agent_output(&self, worker_url: &str, agent_id: AgentId) -> Result<Value> {
        let url = Self::endpoint(worker_url, &format!("/agent/{agent_id}/output"));
        self.get(&url).await
    }

    async fn mission_agents(&self, worker_url: &str, mission_id: &str) -> Result<Vec<Value>> {
        let url = Self::endpoint(worker_url, &format!("/mission/{mission_id}/agents"));
        let body = self.get_fanout(&url).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    async fn statistics(&self, worker_url: &str, mission_id: &str) -> Result<Value> {
        let url = Self::endpoint(worker_url, &format!("/statistics?missionId={mission_id}"));
        self.get_fanout(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_formats_without_double_slash() {
        let url = HttpWorkerClient::endpoint("worker-1:8080", "/addAgent");
        assert_eq!(url, "http://worker-1:8080/addAgent");
    }

    #[test]
    fn per_agent_endpoints_interpolate_the_id() {
        let agent_id = AgentId::new();
        let url = HttpWorkerClient::endpoint(
            "worker-1:8080",
            &format!("/agent/{agent_id}/output"),
        );
        assert_eq!(url, format!("http://worker-1:8080/agent/{agent_id}/output"));
    }
}
