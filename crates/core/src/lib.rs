//! Keeper core logic.
//!
//! This crate provides the keeper's long-running services:
//! - Oracle feeder publishing signed USD prices to the lending contract
//! - Event indexer mirroring lending positions from contract events
//! - Liquidation monitor evaluating health factors against committed prices
//! - Non-overlapping fixed-interval scheduler driving the periodic jobs
//! - Optional read-only HTTP API over prices and mirrored positions
//!
//! Configuration is loaded once at startup and passed to each service.

pub mod config;
mod error;
mod indexer;
mod liquidation_monitor;
mod oracle_feeder;
mod position;
mod position_store;
mod price_cache;
mod scheduler;
mod stats;
pub mod status_api;

#[cfg(test)]
mod testing;

pub use config::{load_config, KeeperConfig, KeeperSecrets};
pub use error::{ErrorKind, KeeperError};
pub use indexer::{EventIndexer, IndexerStats};
pub use liquidation_monitor::{
    Evaluation, InFlightGuard, LiquidationMonitor, MonitorReport, MonitorSettings,
};
pub use oracle_feeder::{CycleOutcome, FeederSettings, FeederState, FeederStats, OracleFeeder};
pub use position::{DenomPrice, Position};
pub use position_store::{ApplyOutcome, PositionStore};
pub use price_cache::PriceCache;
pub use scheduler::{Scheduler, SchedulerStats};
pub use stats::{StatsReporter, StatsSnapshot};
pub use status_api::ApiState;
