//! Adapts the Traffic Controller's record store to the Dependency Graph's
//! `StatusOracle` trait, so graph satisfaction checks read live state
//! without the graph module needing to know how records are stored.

use std::sync::Arc;

use async_trait::async_trait;

use crate::depgraph::StatusOracle;
use crate::model::{AgentId, LifecycleState};

use super::RecordStore;

pub struct RecordStoreOracle {
    records: Arc<RecordStore>,
}

impl RecordStoreOracle {
    pub fn new(records: Arc<RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl StatusOracle for RecordStoreOracle {
    async fn state(&self, agent_id: AgentId) -> Option<LifecycleState> {
        self.records.read().await.get(&agent_id).map(|r| r.state)
    }
}
