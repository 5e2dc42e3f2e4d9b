//! Database module: row models and SQL repositories for the local outbox.
//!
//! This module is split into two submodules:
//! - `model`: raw rows and their conversion into domain entities.
//! - `repo`: pool setup, migrations and SQL-only outbox functions.
//!
//! Server-side tables live with their services under `crate::server`.

pub mod model;
pub mod repo;

pub use repo::*;
