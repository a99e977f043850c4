//! Integration tests for the Traffic Controller's end-to-end agent
//! lifecycle: placement, dependency gating, worker loss and reassignment,
//! mission-command fan-out, cycle safety, and abort cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use traffic_core::collaborators::MissionControlClient;
use traffic_core::controller::{MissionCommandOp, TrafficController};
use traffic_core::depgraph::DependencyGraph;
use traffic_core::model::{AgentId, LifecycleState, MissionId, WorkerId};
use traffic_core::placement::PlacementEngine;
use traffic_core::pool::PoolRegistry;
use traffic_core::worker_client::WorkerClient;

struct StubWorkerClient;

#[async_trait]
impl WorkerClient for StubWorkerClient {
    async fn create_agent(
        &self,
        _worker_url: &str,
        _agent_id: AgentId,
        _payload: &Value,
    ) -> traffic_core::error::Result<()> {
        Ok(())
    }

    async fn pause_agents(&self, _worker_url: &str, _mission_id: &str) -> traffic_core::error::Result<()> {
        Ok(())
    }

    async fn abort_agents(
        &self,
        _worker_url: &str,
        _mission_id: &str,
    ) -> traffic_core::error::Result<Vec<AgentId>> {
        Ok(Vec::new())
    }

    async fn resume_agents(&self, _worker_url: &str, _mission_id: &str) -> traffic_core::error::Result<()> {
        Ok(())
    }

    async fn resume_agent(&self, _worker_url: &str, _agent_id: AgentId) -> traffic_core::error::Result<()> {
        Ok(())
    }

    async fn message_agent(
        &self,
        _worker_url: &str,
        _agent_id: AgentId,
        _envelope: &Value,
    ) -> traffic_core::error::Result<Value> {
        Ok(json!({"ack": true}))
    }

    async fn agent_output(&self, _worker_url: &str, _agent_id: AgentId) -> traffic_core::error::Result<Value> {
        Ok(json!({}))
    }

    async fn mission_agents(
        &self,
        _worker_url: &str,
        _mission_id: &str,
    ) -> traffic_core::error::Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn statistics(&self, _worker_url: &str, _mission_id: &str) -> traffic_core::error::Result<Value> {
        Ok(json!({"byState": {}}))
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
    ) -> traffic_core::error::Result<()> {
        Ok(())
    }
}

fn build_controller(workers: &[(&str, u32)]) -> TrafficController {
    let mut pool = PoolRegistry::new();
    for (id, capacity) in workers {
        pool.register(WorkerId(id.to_string()), format!("{id}:8080"), *capacity)
            .unwrap();
    }
    TrafficController::new(
        Arc::new(RwLock::new(pool)),
        Arc::new(RwLock::new(PlacementEngine::new())),
        Arc::new(RwLock::new(DependencyGraph::new())),
        Arc::new(RwLock::new(HashMap::new())),
        Arc::new(StubWorkerClient),
        Arc::new(NoopMissionControl),
    )
}

#[tokio::test]
async fn basic_placement_assigns_a_worker_and_records_initializing() {
    let controller = build_controller(&[("w1", 3)]);
    let agent_id = controller
        .create_agent(MissionId("m1".into()), vec![], json!({}))
        .await
        .unwrap();

    let record = controller.get_agent(agent_id).await.unwrap();
    assert_eq!(record.state, LifecycleState::Initializing);
    assert_eq!(record.worker_id, Some(WorkerId("w1".into())));
}

#[tokio::test]
async fn dependency_gating_holds_agent_pending_until_prerequisite_completes() {
    let controller = build_controller(&[("w1", 3)]);
    let mission = MissionId("m1".into());

    let prereq = controller
        .create_agent(mission.clone(), vec![], json!({}))
        .await
        .unwrap();
    let dependent = controller
        .create_agent(mission, vec![prereq], json!({}))
        .await
        .unwrap();

    assert_eq!(
        controller.get_agent(dependent).await.unwrap().state,
        LifecycleState::Pending
    );

    controller
        .report_status(prereq, LifecycleState::Running, None)
        .await
        .unwrap();
    assert_eq!(
        controller.get_agent(dependent).await.unwrap().state,
        LifecycleState::Pending,
        "non-terminal prerequisite states must not unblock dependents"
    );

    controller
        .report_status(prereq, LifecycleState::Completed, None)
        .await
        .unwrap();
    assert_eq!(
        controller.get_agent(dependent).await.unwrap().state,
        LifecycleState::Initializing
    );
}

#[tokio::test]
async fn worker_loss_relocates_agents_to_remaining_capacity() {
    let controller = build_controller(&[("w1", 2), ("w2", 2)]);
    let mission = MissionId("m1".into());

    let a1 = controller
        .create_agent(mission.clone(), vec![], json!({}))
        .await
        .unwrap();
    let a2 = controller
        .create_agent(mission, vec![], json!({}))
        .await
        .unwrap();

    assert_eq!(
        controller.get_agent(a1).await.unwrap().worker_id,
        Some(WorkerId("w1".into()))
    );
    assert_eq!(
        controller.get_agent(a2).await.unwrap().worker_id,
        Some(WorkerId("w1".into()))
    );

    let events = controller.relocate_stranded(&WorkerId("w1".into())).await;
    assert!(events.is_empty(), "w1 was never unregistered, nothing should relocate");

    let events = controller
        .unregister_worker(&WorkerId("w1".into()))
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    for agent_id in [a1, a2] {
        assert_eq!(
            controller.get_agent(agent_id).await.unwrap().worker_id,
            Some(WorkerId("w2".into()))
        );
    }
}

#[tokio::test]
async fn mission_pause_fans_out_once_per_worker_and_reports_success() {
    let controller = build_controller(&[("w1", 2)]);
    let mission = MissionId("m1".into());

    controller
        .create_agent(mission.clone(), vec![], json!({}))
        .await
        .unwrap();

    // A mission with no placed agents touches no workers at all.
    let empty_mission = MissionId("m2".into());
    let report = controller
        .mission_command(empty_mission, MissionCommandOp::Pause)
        .await
        .unwrap();
    assert!(report.results.is_empty());

    let report = controller
        .mission_command(mission, MissionCommandOp::Pause)
        .await
        .unwrap();
    assert!(report.all_succeeded());
    assert!(!report.partial());
    assert_eq!(report.results.len(), 1, "one worker holds the mission's only agent");
}

#[tokio::test]
async fn dependency_cycle_is_representable_and_satisfied_reports_false() {
    // B2/Scenario 5: a cycle must not be rejected at declare time, since the
    // core can't know in what order a caller will declare a batch of
    // mutually dependent agents. `is_satisfied` must still terminate.
    let mut graph = DependencyGraph::new();
    let a = AgentId::new();
    let b = AgentId::new();
    graph.add_agent(a);
    graph.add_agent(b);
    graph.declare(b, vec![a]).unwrap();
    assert!(graph.declare(a, vec![b]).is_ok());

    struct AllCompleted;
    #[async_trait]
    impl traffic_core::depgraph::StatusOracle for AllCompleted {
        async fn state(&self, _agent_id: AgentId) -> Option<LifecycleState> {
            Some(LifecycleState::Completed)
        }
    }

    assert!(!graph.is_satisfied(&a, &AllCompleted).await);
    assert!(!graph.is_satisfied(&b, &AllCompleted).await);
}

#[tokio::test]
async fn abort_marks_terminal_purges_graph_and_excludes_agent_from_future_commands() {
    let controller = build_controller(&[("w1", 2)]);
    let mission = MissionId("m1".into());

    let prereq = controller
        .create_agent(mission.clone(), vec![], json!({}))
        .await
        .unwrap();
    let dependent = controller
        .create_agent(mission.clone(), vec![prereq], json!({}))
        .await
        .unwrap();

    controller
        .report_status(prereq, LifecycleState::Aborted, None)
        .await
        .unwrap();

    assert_eq!(
        controller.get_agent(prereq).await.unwrap().worker_id,
        None,
        "aborting must release the agent's placement"
    );
    assert_eq!(
        controller.get_agent(dependent).await.unwrap().state,
        LifecycleState::Pending,
        "an aborted prerequisite never satisfies its dependents"
    );

    // Aborting the only placed agent leaves no worker holding anything for
    // the mission, so a further mission command touches no workers.
    let report = controller
        .mission_command(mission, MissionCommandOp::Pause)
        .await
        .unwrap();
    assert!(
        report.results.is_empty(),
        "no worker still holds an agent for this mission after the sole placement was released"
    );
}
