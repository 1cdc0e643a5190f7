//! Metrics retention library exports

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod source;
pub mod state;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod tiers;
pub mod tracker;
pub mod writer;
