//! Thin clients to the control plane's external collaborators: the service
//! registry (worker discovery), mission control (mission lifecycle
//! notifications), and the security service (bearer token verification).
//!
//! Each is a capability trait with a `reqwest`-backed implementation,
//! grounded the same way as `worker_client::WorkerClient` on
//! `AuthProxyState`'s pattern of a shared client plus a configured base
//! URL. Traits exist so the Traffic Controller and API layer can be
//! exercised in tests against stub collaborators instead of live HTTP
//! endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::model::WorkerId;

const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovers the current set of agent-set workers from the external service
/// registry. Used by C1.refresh.
#[async_trait]
pub trait ServiceRegistryClient: Send + Sync {
    async fn list_workers(&self) -> Result<Vec<(WorkerId, String)>>;
}

#[derive(Debug, Deserialize)]
struct ComponentsResponse {
    #[serde(default)]
    components: Vec<Component>,
}

#[derive(Debug, Deserialize)]
struct Component {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    r#type: String,
    url: String,
}

pub struct HttpServiceRegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServiceRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(COLLABORATOR_TIMEOUT)
                .build()
                .expect("failed to build service registry client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ServiceRegistryClient for HttpServiceRegistryClient {
    /// `GET /requestComponent?type=AgentSet` -> `{components:[{id,type,url}]}`.
    async fn list_workers(&self) -> Result<Vec<(WorkerId, String)>> {
        let url = format!("{}/requestComponent?type=AgentSet", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Unreachable(format!("service registry unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::Unreachable(format!(
                "service registry responded {}",
                resp.status()
            )));
        }

        let body: ComponentsResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        Ok(body
            .components
            .into_iter()
            .map(|c| (WorkerId(c.id), c.url))
            .collect())
    }
}

/// Notifies mission control of mission-scoped lifecycle events, using the
/// same envelope shape as the inbound `/agentStatisticsUpdate` endpoint.
/// Best-effort: callers log failures and proceed, since a dropped
/// notification never corrupts control-plane state.
#[async_trait]
pub trait MissionControlClient: Send + Sync {
    async fn notify_agent_state(
        &self,
        mission_id: &str,
        agent_id: &str,
        status: &str,
        statistics: Option<&Value>,
    ) -> Result<()>;
}

pub struct HttpMissionControlClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMissionControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(COLLABORATOR_TIMEOUT)
                .build()
                .expect("failed to build mission control client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MissionControlClient for HttpMissionControlClient {
    /// `POST /agentStatisticsUpdate` `{agentId, missionId, status, statistics}`.
    async fn notify_agent_state(
        &self,
        mission_id: &str,
        agent_id: &str,
        status: &str,
        statistics: Option<&Value>,
    ) -> Result<()> {
        let url = format!("{}/agentStatisticsUpdate", self.base_url);
        let body = serde_json::json!({
            "agentId": agent_id,
            "missionId": mission_id,
            "status": status,
            "statistics": statistics,
        });
        let resp = self.client.post(&url).json(&body).send().await;

        match resp {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => {
                warn!(status = %r.status(), mission_id, agent_id, "mission control rejected notification");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, mission_id, agent_id, "mission control unreachable, dropping notification");
                Ok(())
            }
        }
    }
}

/// Receives empty-set reaper flags for workers the pool thinks are idle.
/// The actual deprovisioning workflow is out of scope here (see Non-goals);
/// this is the confirmation hook that workflow would eventually call back
/// through, modeled as a no-op so the reaper has a real collaborator to
/// report to rather than silently discarding what it finds.
#[async_trait]
pub trait DeployCollaborator: Send + Sync {
    async fn flag_idle_worker(&self, worker_id: &WorkerId);
}

/// Logs the flag and otherwise does nothing; stands in for a deploy/
/// deprovisioning service that would decide whether to actually tear the
/// worker down.
pub struct NoopDeployCollaborator;

#[async_trait]
impl DeployCollaborator for NoopDeployCollaborator {
    async fn flag_idle_worker(&self, worker_id: &WorkerId) {
        tracing::info!(%worker_id, "flagged idle worker for deprovisioning (no deploy collaborator configured)");
    }
}

/// Verifies a bearer token presented on inbound requests. Verification only
/// — the control plane never issues tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

/// Compares against the single configured token. Used whenever no security
/// service URL is configured, and as the fallback when the remote verifier
/// is unreachable.
pub struct StaticTokenVerifier {
    expected: String,
}

impl StaticTokenVerifier {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> bool {
        // Constant-time-ish comparison isn't attempted here; the token is a
        // shared deployment secret, not a per-user credential.
        token == self.expected
    }
}

/// Delegates verification to the external security service, falling back to
/// the static token if the service is unreachable so a transient outage
/// there doesn't lock every caller out of the control plane.
pub struct RemoteTokenVerifier {
    client: reqwest::Client,
    base_url: String,
    fallback: StaticTokenVerifier,
}

impl RemoteTokenVerifier {
    pub fn new(base_url: impl Into<String>, fallback_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(COLLABORATOR_TIMEOUT)
                .build()
                .expect("failed to build security client"),
            base_url: base_url.into(),
            fallback: StaticTokenVerifier::new(fallback_token),
        }
    }
}

#[async_trait]
impl TokenVerifier for RemoteTokenVerifier {
    async fn verify(&self, token: &str) -> bool {
        let url = format!("{}/verify", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await;

        match resp {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                warn!(error = %e, "security service unreachable, falling back to static token");
                self.fallback.verify(token).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_matches_exact_token() {
        let verifier = StaticTokenVerifier::new("secret");
        assert!(verifier.verify("secret").await);
        assert!(!verifier.verify("wrong").await);
    }
}
