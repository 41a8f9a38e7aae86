//! wpdemo - ephemeral WordPress demo sites on demand
//!
//! This library provides an orchestrator that:
//! - Provisions a per-tenant WordPress container and MySQL database per request
//! - Routes each site through a label-configured reverse proxy at `<id>.<domain>`
//! - Keeps a pool of ready sites so most requests are answered instantly
//! - Builds the golden image sites are cloned from
//! - Reclaims sites once they outlive the retention period

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod golden;
pub mod labels;
pub mod mysql;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod site;
pub mod sweeper;
pub mod tasks;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
