//! Attribution of staking rewards to validators.
//!
//! The updater indexes block rewards, withdrawals, balance snapshots and Rocket Pool minipools
//! into PostgreSQL. The server answers per-validator reward queries from the indexed data.

pub mod aggregation;
pub mod builders;
pub mod classifier;
pub mod client;
pub mod cli;
pub mod config;
pub mod consensus_rewards;
pub mod database;
pub mod indexer;
pub mod logger;
pub mod metrics;
pub mod reconcile;
pub mod rocket_pool;
pub mod server;
pub mod store;
pub mod types;
pub mod updater;
