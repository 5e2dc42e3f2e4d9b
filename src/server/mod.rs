//! Sync server: batch ingest, inventory reconciliation, practitioner
//! locations and appointment assignment over one SQLite pool.

pub mod assignment;
pub mod http;
pub mod ingest;
pub mod inventory;
pub mod ledger;
pub mod locations;
pub mod schedule;
pub mod visits;

use crate::config::Config;
use crate::db::Pool;
use std::sync::Arc;

/// Shared handler state; cheap to clone.
#[derive(Clone)]
pub struct ServerState {
    pub pool: Pool,
    pub ingest: ingest::SyncIngest,
    pub inventory: inventory::InventoryService,
    pub resolver: assignment::AssignmentResolver,
    /// Bearer token required on `/v1` routes when set.
    pub api_token: Option<Arc<str>>,
}

impl ServerState {
    pub fn new(pool: Pool, tie_epsilon_km: f64, api_token: Option<String>) -> Self {
        Self {
            ingest: ingest::SyncIngest::new(pool.clone()),
            inventory: inventory::InventoryService::new(pool.clone()),
            resolver: assignment::AssignmentResolver::new(pool.clone(), tie_epsilon_km),
            api_token: api_token.filter(|t| !t.is_empty()).map(Arc::from),
            pool,
        }
    }

    pub fn from_config(pool: Pool, cfg: &Config) -> Self {
        Self::new(pool, cfg.assignment.tie_epsilon_km, cfg.server.api_token.clone())
    }
}
