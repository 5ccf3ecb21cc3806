//! Eulend keeper
//!
//! Off-chain companion of the lending contract:
//! - Publishes signed USD prices on a fixed interval
//! - Mirrors borrower positions from contract events over WebSocket
//! - Liquidates positions whose health factor falls below the threshold
//! - Optionally serves a read-only HTTP API and logs periodic stats

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keeper_api::CoinGeckoClient;
use keeper_chain::{
    AccountSigner, ChainClient, ContractQuerier, EventListener, FeeConfig, RpcClient, TxBroadcaster,
};
use keeper_core::{
    load_config, status_api, ApiState, EventIndexer, FeederSettings, KeeperSecrets,
    LiquidationMonitor, MonitorSettings, OracleFeeder, PositionStore, PriceCache, Scheduler,
    StatsReporter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    // KEEPER_CONFIG selects a TOML file, otherwise KEEPER_PROFILE picks a profile
    let config = load_config()?;
    config.log_config();

    let secrets = KeeperSecrets::from_env();
    let key = secrets
        .signing_key(config.chain.coin_type)
        .context("Failed to load keeper key")?;

    let rpc = Arc::new(
        RpcClient::new(
            &config.chain.rpc_url,
            Duration::from_secs(config.chain.rpc_timeout_secs),
        )
        .context("Invalid RPC endpoint")?,
    );

    let fee = FeeConfig {
        denom: config.chain.fee_denom.clone(),
        amount: u128::from(config.chain.fee_amount),
        gas_limit: config.chain.gas_limit,
    };
    let chain: Arc<dyn ChainClient> = rpc.clone();
    let signer = Arc::new(
        AccountSigner::connect(chain, key.clone(), &config.chain.bech32_prefix, fee)
            .await
            .context("Failed to initialize account signer")?
            .with_commit_timing(
                Duration::from_secs(config.chain.confirm_timeout_secs),
                Duration::from_secs(2),
            ),
    );
    let broadcaster: Arc<dyn TxBroadcaster> = signer.clone();

    let cache = Arc::new(PriceCache::new());
    let store = Arc::new(PositionStore::new(&config.indexer.default_debt_denom));
    let cancel = CancellationToken::new();

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut reporter = StatsReporter::new(store.clone(), cache.clone());
    reporter.signer = Some(signer);

    if config.feeder.enabled {
        let feeder = Arc::new(OracleFeeder::new(
            Arc::new(CoinGeckoClient::new(
                &config.feeder.price_api_url,
                secrets.price_api_key.clone(),
            )),
            broadcaster.clone(),
            key,
            cache.clone(),
            FeederSettings {
                contract: config.chain.contract_address.clone(),
                assets: config.tracked_assets(),
                staleness_bound: config.staleness_bound(),
                confirm: config.feeder.confirm,
            },
        ));
        let scheduler = Scheduler::new("feeder", config.feed_interval(), cancel.clone());
        reporter.schedulers.push(("feeder", scheduler.stats()));
        reporter.feeder = Some(feeder.clone());
        handles.push(tokio::spawn(scheduler.run(move || {
            let feeder = feeder.clone();
            async move {
                feeder.run_cycle().await;
            }
        })));
    }

    if config.indexer.enabled {
        let listener = Arc::new(EventListener::new(
            config.chain.websocket_url(),
            &config.chain.contract_address,
            rpc.clone(),
        ));
        let indexer = Arc::new(
            EventIndexer::new(listener, store.clone(), &config.chain.contract_address)
                .with_reconnect(
                    Duration::from_millis(config.indexer.reconnect_initial_ms),
                    Duration::from_secs(config.indexer.reconnect_max_secs),
                )
                .with_start_height(config.indexer.start_height),
        );
        reporter.indexer = Some(indexer.clone());
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { indexer.run(cancel).await }));
    }

    let monitor = Arc::new(LiquidationMonitor::new(
        store.clone(),
        cache.clone(),
        broadcaster,
        MonitorSettings {
            contract: config.chain.contract_address.clone(),
            threshold: config.monitor.health_factor_threshold,
            staleness_bound: config.staleness_bound(),
            denoms: config.denoms.clone(),
            dry_run: config.monitor.dry_run,
            confirm: config.monitor.confirm,
            in_flight_ttl: Duration::from_secs(config.monitor.in_flight_ttl_secs),
        },
    ));

    if config.monitor.enabled {
        let scheduler = Scheduler::new("monitor", config.monitor_interval(), cancel.clone());
        reporter.schedulers.push(("monitor", scheduler.stats()));
        reporter.monitor = Some(monitor.clone());
        let job = {
            let monitor = monitor.clone();
            move || {
                let monitor = monitor.clone();
                async move {
                    monitor.run_cycle().await;
                }
            }
        };
        handles.push(tokio::spawn(scheduler.run(job)));
    }

    if config.status.api_enabled {
        let querier: Arc<dyn ContractQuerier> = rpc;
        let state = ApiState {
            store,
            cache,
            querier: Some(querier),
            contract: config.chain.contract_address.clone(),
            denoms: config.denoms.clone(),
            staleness_bound: config.staleness_bound(),
        };
        let addr = config.status.listen_addr.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = status_api::serve(&addr, state, cancel).await {
                error!(error = %e, "Status API failed");
            }
        }));
    }

    if let Some(interval) = config.stats_interval() {
        let reporter = Arc::new(reporter);
        let scheduler = Scheduler::new("stats", interval, cancel.clone());
        handles.push(tokio::spawn(scheduler.run(move || {
            let reporter = reporter.clone();
            async move { reporter.log() }
        })));
    }

    info!(tasks = handles.len(), "Keeper running");

    wait_for_shutdown().await?;
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }
    monitor.drain().await;

    info!("Keeper stopped");
    Ok(())
}

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the filter.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keeper_core=debug,keeper_chain=debug")),
        )
        .init();
}

/// Resolve on SIGINT (Ctrl-C) or SIGTERM (`systemctl stop`).
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    Ok(())
}
