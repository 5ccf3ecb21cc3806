//! Keeper runtime configuration with profile support.
//!
//! Provides every tunable of the feeder, the monitor, the indexer and the
//! status surface with serde defaults, plus named profiles (testing, production).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub feeder: FeederConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub status: StatusConfig,

    /// On-chain denom -> price asset mapping
    #[serde(default = "default_denoms")]
    pub denoms: BTreeMap<String, DenomConfig>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Chain endpoints, contract and fees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// CometBFT RPC endpoint (HTTP)
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// CometBFT websocket endpoint; derived from `rpc_url` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Lending contract address
    #[serde(default)]
    pub contract_address: String,

    #[serde(default = "default_bech32_prefix")]
    pub bech32_prefix: String,

    /// BIP-44 coin type for mnemonic derivation
    #[serde(default = "default_coin_type")]
    pub coin_type: u32,

    #[serde(default = "default_fee_denom")]
    pub fee_denom: String,

    #[serde(default = "default_fee_amount")]
    pub fee_amount: u64,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Per-request RPC timeout (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// How long to wait for a broadcast transaction to be included (seconds)
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

fn default_rpc_url() -> String {
    "http://localhost:26657".to_string()
}
fn default_bech32_prefix() -> String {
    "cosmos".to_string()
}
fn default_coin_type() -> u32 {
    118
}
fn default_fee_denom() -> String {
    "uatom".to_string()
}
fn default_fee_amount() -> u64 {
    5_000
}
fn default_gas_limit() -> u64 {
    500_000
}
fn default_rpc_timeout() -> u64 {
    10
}
fn default_confirm_timeout() -> u64 {
    60
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            ws_url: None,
            contract_address: String::new(),
            bech32_prefix: default_bech32_prefix(),
            coin_type: default_coin_type(),
            fee_denom: default_fee_denom(),
            fee_amount: default_fee_amount(),
            gas_limit: default_gas_limit(),
            rpc_timeout_secs: default_rpc_timeout(),
            confirm_timeout_secs: default_confirm_timeout(),
        }
    }
}

impl ChainConfig {
    /// Websocket endpoint, derived from the RPC URL unless set explicitly.
    pub fn websocket_url(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        let base = self.rpc_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/websocket")
    }
}

/// Oracle feeder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Feed cycle interval (seconds)
    #[serde(default = "default_feed_interval")]
    pub interval_secs: u64,

    /// Price-source asset ids to publish
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,

    /// Maximum quote age (seconds); two feed intervals when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_secs: Option<u64>,

    /// Price API base URL
    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,

    /// Wait for inclusion before treating a cycle as committed
    #[serde(default = "default_true")]
    pub confirm: bool,
}

fn default_true() -> bool {
    true
}
fn default_feed_interval() -> u64 {
    30
}
fn default_assets() -> Vec<String> {
    vec![
        "bitcoin".to_string(),
        "ethereum".to_string(),
        "cosmos".to_string(),
    ]
}
fn default_price_api_url() -> String {
    keeper_api::PUBLIC_API_URL.to_string()
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_feed_interval(),
            assets: default_assets(),
            staleness_secs: None,
            price_api_url: default_price_api_url(),
            confirm: true,
        }
    }
}

/// Liquidation monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scan interval (seconds)
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// Positions with a health factor strictly below this are liquidated
    #[serde(default = "default_hf_threshold")]
    pub health_factor_threshold: Decimal,

    /// Log decisions without submitting transactions
    #[serde(default)]
    pub dry_run: bool,

    /// Upper bound on how long a submitted liquidation blocks resubmission (seconds)
    #[serde(default = "default_in_flight_ttl")]
    pub in_flight_ttl_secs: u64,

    /// Wait for inclusion of liquidation transactions
    #[serde(default = "default_true")]
    pub confirm: bool,
}

fn default_monitor_interval() -> u64 {
    60
}
fn default_hf_threshold() -> Decimal {
    Decimal::ONE
}
fn default_in_flight_ttl() -> u64 {
    300
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
            health_factor_threshold: default_hf_threshold(),
            dry_run: false,
            in_flight_ttl_secs: default_in_flight_ttl(),
            confirm: true,
        }
    }
}

/// Event indexer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First resubscribe delay (milliseconds)
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Resubscribe delay cap (seconds)
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Debt denom for borrow events that do not name one
    #[serde(default = "default_debt_denom")]
    pub default_debt_denom: String,

    /// Replay contract transactions from this height before following live events
    #[serde(default)]
    pub start_height: Option<u64>,
}

fn default_reconnect_initial() -> u64 {
    1_000
}
fn default_reconnect_max() -> u64 {
    30
}
fn default_debt_denom() -> String {
    "uusdc".to_string()
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_secs: default_reconnect_max(),
            default_debt_denom: default_debt_denom(),
            start_height: None,
        }
    }
}

/// Read-only HTTP API and periodic stats logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub api_enabled: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Stats log interval (seconds), 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_stats_interval() -> u64 {
    300
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            api_enabled: false,
            listen_addr: default_listen_addr(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Price mapping for one on-chain denom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenomConfig {
    /// Price-source asset id
    pub asset_id: String,
    /// Decimal places of the on-chain amount
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_decimals() -> u32 {
    6
}

fn default_denoms() -> BTreeMap<String, DenomConfig> {
    BTreeMap::from([
        (
            "uatom".to_string(),
            DenomConfig {
                asset_id: "cosmos".to_string(),
                decimals: 6,
            },
        ),
        (
            "uusdc".to_string(),
            DenomConfig {
                asset_id: "usd-coin".to_string(),
                decimals: 6,
            },
        ),
    ])
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            chain: ChainConfig::default(),
            feeder: FeederConfig::default(),
            monitor: MonitorConfig::default(),
            indexer: IndexerConfig::default(),
            status: StatusConfig::default(),
            denoms: default_denoms(),
        }
    }
}

impl KeeperConfig {
    /// Local chain, fast cadence, dry-run liquidations.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            feeder: FeederConfig {
                interval_secs: 10,
                confirm: false,
                ..Default::default()
            },
            monitor: MonitorConfig {
                interval_secs: 15,
                dry_run: true,
                in_flight_ttl_secs: 60,
                ..Default::default()
            },
            status: StatusConfig {
                api_enabled: true,
                stats_interval_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Conservative settings for a live deployment.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            chain: ChainConfig {
                rpc_timeout_secs: 15,
                confirm_timeout_secs: 90,
                ..Default::default()
            },
            feeder: FeederConfig {
                price_api_url: keeper_api::PRO_API_URL.to_string(),
                ..Default::default()
            },
            indexer: IndexerConfig {
                reconnect_max_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Profile named by `KEEPER_PROFILE`, or the default one.
    /// Supported values: testing, production
    pub fn from_env() -> Self {
        let profile = std::env::var("KEEPER_PROFILE").unwrap_or_else(|_| "default".to_string());
        Self::for_profile(&profile)
    }

    pub fn for_profile(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_secs(self.feeder.interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.status.stats_interval_secs > 0)
            .then(|| Duration::from_secs(self.status.stats_interval_secs))
    }

    /// Maximum accepted quote age, shared by the feeder and the monitor.
    pub fn staleness_bound(&self) -> Duration {
        Duration::from_secs(
            self.feeder
                .staleness_secs
                .unwrap_or(self.feeder.interval_secs * 2),
        )
    }

    /// Assets the feeder prices: the configured list plus every mapped denom's asset.
    pub fn tracked_assets(&self) -> BTreeSet<String> {
        self.feeder
            .assets
            .iter()
            .cloned()
            .chain(self.denoms.values().map(|d| d.asset_id.clone()))
            .collect()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.chain.contract_address.is_empty() {
            return Err("chain.contract_address is required".to_string());
        }
        if self.chain.rpc_url.is_empty() {
            return Err("chain.rpc_url is required".to_string());
        }
        if self.feeder.interval_secs == 0 || self.monitor.interval_secs == 0 {
            return Err("intervals must be greater than zero".to_string());
        }
        if self.staleness_bound().is_zero() {
            return Err("feeder.staleness_secs must be greater than zero".to_string());
        }
        if self.monitor.health_factor_threshold <= Decimal::ZERO {
            return Err("monitor.health_factor_threshold must be positive".to_string());
        }
        if self.feeder.enabled && self.tracked_assets().is_empty() {
            return Err("feeder has no assets to price".to_string());
        }
        if let Some((denom, _)) = self.denoms.iter().find(|(_, d)| d.decimals > 18) {
            return Err(format!("denoms.{denom}.decimals must be at most 18"));
        }
        if self.status.api_enabled && self.status.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "status.listen_addr {:?} is not a socket address",
                self.status.listen_addr
            ));
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Keeper configuration loaded");
        tracing::info!(
            rpc = %self.chain.rpc_url,
            ws = %self.chain.websocket_url(),
            contract = %self.chain.contract_address,
            fee = %format!("{}{}", self.chain.fee_amount, self.chain.fee_denom),
            gas_limit = self.chain.gas_limit,
            "Chain"
        );
        tracing::info!(
            enabled = self.feeder.enabled,
            interval_secs = self.feeder.interval_secs,
            staleness_secs = self.staleness_bound().as_secs(),
            assets = ?self.tracked_assets(),
            "Oracle feeder"
        );
        tracing::info!(
            enabled = self.monitor.enabled,
            interval_secs = self.monitor.interval_secs,
            threshold = %self.monitor.health_factor_threshold,
            dry_run = self.monitor.dry_run,
            "Liquidation monitor"
        );
        tracing::info!(
            enabled = self.indexer.enabled,
            start_height = ?self.indexer.start_height,
            denoms = self.denoms.len(),
            "Event indexer"
        );
        tracing::info!(
            api_enabled = self.status.api_enabled,
            listen_addr = %self.status.listen_addr,
            stats_interval_secs = self.status.stats_interval_secs,
            "Status"
        );
    }
}
