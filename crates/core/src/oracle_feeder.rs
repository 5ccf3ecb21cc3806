//! Oracle feeder: publishes signed USD prices to the lending contract.
//!
//! One cycle walks `Idle -> Fetching -> Signing -> Broadcasting ->
//! {Committed | Failed} -> Idle`. The scheduler guarantees at most one cycle
//! in flight; a failed cycle is logged and the next tick starts over.

use keeper_api::{unix_now, PriceQuote, PriceSource};
use keeper_chain::{
    to_fixed_price, ContractMsg, ExecuteMsg, SignedPriceUpdate, SigningKey, TxBroadcaster,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::KeeperError;
use crate::price_cache::PriceCache;

const MEMO: &str = "oracle price update";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederState {
    Idle,
    Fetching,
    Signing,
    Broadcasting,
    Committed,
    Failed,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Committed { tx_hash: String, assets: Vec<String> },
    /// Nothing fresh to publish
    Skipped,
    Failed(KeeperError),
}

#[derive(Debug, Default)]
pub struct FeederStats {
    pub cycles: AtomicU64,
    pub committed: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

/// Feeder settings derived from configuration.
#[derive(Debug, Clone)]
pub struct FeederSettings {
    pub contract: String,
    pub assets: BTreeSet<String>,
    pub staleness_bound: Duration,
    /// Wait for inclusion before committing prices locally
    pub confirm: bool,
}

pub struct OracleFeeder {
    source: Arc<dyn PriceSource>,
    broadcaster: Arc<dyn TxBroadcaster>,
    key: SigningKey,
    cache: Arc<PriceCache>,
    settings: FeederSettings,
    state: Mutex<FeederState>,
    last_result: Mutex<Option<FeederState>>,
    stats: FeederStats,
}

impl OracleFeeder {
    pub fn new(
        source: Arc<dyn PriceSource>,
        broadcaster: Arc<dyn TxBroadcaster>,
        key: SigningKey,
        cache: Arc<PriceCache>,
        settings: FeederSettings,
    ) -> Self {
        Self {
            source,
            broadcaster,
            key,
            cache,
            settings,
            state: Mutex::new(FeederState::Idle),
            last_result: Mutex::new(None),
            stats: FeederStats::default(),
        }
    }

    pub fn state(&self) -> FeederState {
        *self.state.lock()
    }

    /// Terminal state of the last finished cycle (`None` after a skip or before any cycle).
    pub fn last_result(&self) -> Option<FeederState> {
        *self.last_result.lock()
    }

    pub fn stats(&self) -> &FeederStats {
        &self.stats
    }

    fn transition(&self, next: FeederState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "Feeder state");
        *state = next;
    }

    fn finish(&self, result: Option<FeederState>) {
        if let Some(terminal) = result {
            self.transition(terminal);
        }
        *self.last_result.lock() = result;
        self.transition(FeederState::Idle);
    }

    fn fail(&self, error: KeeperError) -> CycleOutcome {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, kind = ?error.kind(), "Price feed cycle failed");
        self.finish(Some(FeederState::Failed));
        CycleOutcome::Failed(error)
    }

    /// Quotes that exist and are within the staleness bound.
    fn select_fresh(&self, quotes: &std::collections::HashMap<String, PriceQuote>, now: u64) -> Vec<PriceQuote> {
        let bound = self.settings.staleness_bound.as_secs();
        self.settings
            .assets
            .iter()
            .filter_map(|asset| match quotes.get(asset) {
                Some(q) if q.is_fresh(bound, now) => Some(q.clone()),
                Some(q) => {
                    debug!(asset = %asset, age_secs = q.age_secs(now), "Dropping stale quote");
                    None
                }
                None => {
                    debug!(asset = %asset, "No quote");
                    None
                }
            })
            .collect()
    }

    /// Run one feed cycle.
    #[instrument(skip(self), fields(assets = self.settings.assets.len()))]
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        self.transition(FeederState::Fetching);
        let quotes = self.source.fetch_prices(&self.settings.assets).await;
        let fresh = self.select_fresh(&quotes, unix_now());

        self.transition(FeederState::Signing);
        let mut signed = Vec::with_capacity(fresh.len());
        let mut published = Vec::with_capacity(fresh.len());
        for quote in fresh {
            let Some(price) = to_fixed_price(quote.usd_price) else {
                warn!(asset = %quote.asset_id, price = %quote.usd_price, "Price not representable on chain");
                continue;
            };
            signed.push(SignedPriceUpdate::sign(
                &self.key,
                &quote.asset_id,
                price,
                quote.observed_at,
            ));
            published.push(quote);
        }

        if signed.is_empty() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            info!(source = self.source.name(), "No fresh prices, skipping broadcast");
            self.finish(None);
            return CycleOutcome::Skipped;
        }

        self.transition(FeederState::Broadcasting);
        let msg = ContractMsg::new(
            &self.settings.contract,
            ExecuteMsg::UpdatePrices { prices: signed },
        );
        let result = match self.broadcaster.sign_and_broadcast(vec![msg], MEMO).await {
            Ok(result) => result,
            Err(e) => return self.fail(e.into()),
        };

        if self.settings.confirm {
            if let Err(e) = self.broadcaster.wait_for_commit(&result.tx_hash).await {
                return self.fail(e.into());
            }
        }

        let assets: Vec<String> = published.iter().map(|q| q.asset_id.clone()).collect();
        self.cache.commit(published);
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        info!(
            tx_hash = %result.tx_hash,
            sequence = result.sequence,
            assets = ?assets,
            "Prices committed"
        );
        self.finish(Some(FeederState::Committed));

        CycleOutcome::Committed {
            tx_hash: result.tx_hash,
            assets,
        }
    }
}
