pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod geo;
pub mod model;
pub mod outbox;
pub mod server;
pub mod sync;
pub mod tracker;
