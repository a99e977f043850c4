//! Agent Traffic Core
//!
//! A distributed control-plane service that places, tracks, coordinates, and
//! routes messages between agents hosted on a pool of agent-set workers.
//!
//! # Architecture
//!
//! - `pool` — worker inventory and occupancy (PoolRegistry, C1)
//! - `placement` — agent -> worker assignment (Placement Engine, C2)
//! - `depgraph` — agent dependency DAG and satisfaction (Dependency Graph, C3)
//! - `controller` — public surface: create/command/status/forward/stats (Traffic Controller, C4)
//! - `api` — HTTP transport: axum routes, auth, error mapping
//! - `worker_client` / `collaborators` — outbound calls to workers and external services
//! - `background` — periodic maintenance tasks

pub mod api;
pub mod background;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod depgraph;
pub mod error;
pub mod model;
pub mod placement;
pub mod pool;
pub mod worker_client;

pub use error::{CoreError, Result};

/// Crate version, surfaced in health/info responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
