//! Configuration system for the keeper.
//!
//! This module provides:
//! - Runtime configuration (profiles, intervals, thresholds, denom mapping)
//! - Loading from a TOML file or a named profile, with environment overrides
//! - Secrets from the environment (signing key material, price API key)

mod keeper;
mod loader;

pub use keeper::{
    ChainConfig, DenomConfig, FeederConfig, IndexerConfig, KeeperConfig, MonitorConfig,
    StatusConfig,
};
pub use loader::{expand_env, load_config, load_file, parse_toml, KeeperSecrets};
