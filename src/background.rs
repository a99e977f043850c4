//! Periodic maintenance tasks: worker inventory refresh, the empty-set
//! reaper, and an orphan sweep over stale agent records.
//!
//! Follows `commands::api::server`'s background task pattern (`tokio::spawn`
//! a loop around a `tokio::time::interval`, exit on a cancellation signal),
//! used there for rate-limiter cleanup, generalized here to three distinct
//! maintenance loops sharing a `CancellationToken` for clean shutdown
//! instead of running forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{DeployCollaborator, ServiceRegistryClient};
use crate::controller::TrafficController;
use crate::pool::PoolRegistry;

/// A worker idle at zero occupancy for this long is a candidate for the
/// empty-set reaper to flag.
pub const IDLE_WORKER_THRESHOLD: chrono::Duration = chrono::Duration::minutes(5);

/// An agent record that hasn't moved in this long is a candidate for the
/// orphan sweep to probe.
pub const ORPHAN_STALENESS_THRESHOLD: chrono::Duration = chrono::Duration::seconds(120);

/// Polls the service registry for the current worker inventory and
/// reconciles it into the pool. Workers the registry stops reporting are
/// marked unreachable and eventually removed by `PoolRegistry::refresh`;
/// any worker newly marked `Removed` this tick has its agents relocated
/// immediately rather than waiting for the next orphan sweep.
pub fn spawn_worker_refresh(
    pool: Arc<RwLock<PoolRegistry>>,
    controller: Arc<TrafficController>,
    registry_client: Option<Arc<dyn ServiceRegistryClient>>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(registry_client) = registry_client else {
            info!("no service registry configured, worker refresh loop disabled");
            return;
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("worker refresh loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match registry_client.list_workers().await {
                Ok(entries) => {
                    let outcome = {
                        let mut pool = pool.write().await;
                        pool.note_refresh_success();
                        pool.refresh(&entries)
                    };
                    if !outcome.added.is_empty() || !outcome.removed.is_empty() {
                        info!(
                            added = outcome.added.len(),
                            removed = outcome.removed.len(),
                            unreachable = outcome.marked_unreachable.len(),
                            "worker refresh reconciled pool"
                        );
                    }
                    for worker_id in &outcome.removed {
                        let events = controller.relocate_stranded(worker_id).await;
                        if !events.is_empty() {
                            info!(%worker_id, relocated = events.len(), "relocated agents off removed worker");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "service registry unreachable, skipping this refresh tick");
                    pool.write().await.note_refresh_failure();
                }
            }
        }
    })
}

/// Flags workers sitting at zero occupancy with no placement in the last
/// `IDLE_WORKER_THRESHOLD` to the deploy collaborator. Never removes a
/// worker from the pool itself — that only happens via `PoolRegistry::refresh`
/// once the service registry stops reporting it, or an explicit
/// `unregister_worker` call; this loop only reports candidates.
pub fn spawn_empty_set_reaper(
    pool: Arc<RwLock<PoolRegistry>>,
    deploy: Arc<dyn DeployCollaborator>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("empty-set reaper shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let idle = { pool.read().await.idle_workers(IDLE_WORKER_THRESHOLD) };
            if !idle.is_empty() {
                info!(count = idle.len(), "empty-set reaper flagging idle workers");
            }
            for worker_id in idle {
                deploy.flag_idle_worker(&worker_id).await;
            }
        }
    })
}

/// Safety net: periodically probes agent records whose state hasn't
/// advanced within `ORPHAN_STALENESS_THRESHOLD`, refreshing them from their
/// owning worker's `/agent/:id/output`. Exists to catch records a dropped
/// or delayed status update left behind, not as the primary update path.
pub fn spawn_orphan_sweep(
    controller: Arc<TrafficController>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("orphan sweep shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let stale = controller.stale_agents(ORPHAN_STALENESS_THRESHOLD).await;
            if !stale.is_empty() {
                info!(count = stale.len(), "orphan sweep probing stale agent records");
            }
            for agent_id in stale {
                controller.probe_and_refresh(agent_id).await;
            }
        }
    })
}
