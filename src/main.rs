//! Binary entry point: load configuration, wire up the four components in
//! their fixed lock order, register the primary worker, spawn background
//! maintenance tasks, and serve the HTTP API until shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use traffic_core::api::routes::AppState;
use traffic_core::api::server::{build_router, serve};
use traffic_core::background;
use traffic_core::collaborators::{
    DeployCollaborator, HttpMissionControlClient, HttpServiceRegistryClient, MissionControlClient,
    NoopDeployCollaborator, RemoteTokenVerifier, ServiceRegistryClient, StaticTokenVerifier,
    TokenVerifier,
};
use traffic_core::config::Config;
use traffic_core::controller::{PrimaryWorkerConfig, TrafficController};
use traffic_core::depgraph::DependencyGraph;
use traffic_core::model::WorkerId;
use traffic_core::placement::PlacementEngine;
use traffic_core::pool::PoolRegistry;
use traffic_core::worker_client::HttpWorkerClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::from_env()?;
    info!(port = config.port, "starting traffic-core");

    let mut pool = PoolRegistry::new();
    if let Some(primary_url) = &config.primary_worker_url {
        pool.register(
            WorkerId("primary".to_string()),
            primary_url.clone(),
            config.primary_worker_capacity,
        )?;
        info!(url = %primary_url, capacity = config.primary_worker_capacity, "registered primary worker");
    } else {
        warn!("no PRIMARY_WORKER_URL configured; pool starts empty until a registry refresh adds workers");
    }

    let pool = Arc::new(RwLock::new(pool));
    let placement = Arc::new(RwLock::new(PlacementEngine::new()));
    let graph = Arc::new(RwLock::new(DependencyGraph::new()));
    let records = Arc::new(RwLock::new(HashMap::new()));

    let worker_client = Arc::new(HttpWorkerClient::new());

    let mission_control: Arc<dyn MissionControlClient> = match &config.missioncontrol_url {
        Some(url) => Arc::new(HttpMissionControlClient::new(url.clone())),
        None => Arc::new(NoopMissionControl),
    };

    let registry_client: Option<Arc<dyn ServiceRegistryClient>> = config
        .postoffice_url
        .as_ref()
        .map(|url| Arc::new(HttpServiceRegistryClient::new(url.clone())) as Arc<dyn ServiceRegistryClient>);

    let token_verifier: Arc<dyn TokenVerifier> = match &config.security_url {
        Some(url) => Arc::new(RemoteTokenVerifier::new(url.clone(), config.bearer_token.clone())),
        None => Arc::new(StaticTokenVerifier::new(config.bearer_token.clone())),
    };

    let deploy_collaborator: Arc<dyn DeployCollaborator> = Arc::new(NoopDeployCollaborator);

    let primary_worker_config = config.primary_worker_url.as_ref().map(|url| PrimaryWorkerConfig {
        worker_id: WorkerId("primary".to_string()),
        url: url.clone(),
        capacity: config.primary_worker_capacity,
    });

    let controller = Arc::new(TrafficController::with_primary_worker(
        pool.clone(),
        placement.clone(),
        graph.clone(),
        records.clone(),
        worker_client,
        mission_control,
        primary_worker_config,
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(background::spawn_worker_refresh(
        pool.clone(),
        controller.clone(),
        registry_client,
        Duration::from_secs(config.worker_refresh_interval_secs),
        cancel.clone(),
    ));
    tasks.push(background::spawn_empty_set_reaper(
        pool.clone(),
        deploy_collaborator,
        Duration::from_secs(config.reaper_interval_secs),
        cancel.clone(),
    ));
    tasks.push(background::spawn_orphan_sweep(
        controller.clone(),
        Duration::from_secs(config.orphan_sweep_interval_secs),
        cancel.clone(),
    ));

    let app_state = AppState {
        controller: controller.clone(),
        pool: pool.clone(),
    };
    let router = build_router(app_state, token_verifier);

    serve(router, config.port).await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

struct NoopMissionControl;

#[async_trait::async_trait]
impl MissionControlClient for NoopMissionControl {
    async fn notify_agent_state(
        &self,
        _mission_id: &str,
        _agent_id: &str,
        _status: &str,
        _statistics: Option<&serde_json::Value>,
    ) -> traffic_core::Result<()> {
        Ok(())
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("traffic_core=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
