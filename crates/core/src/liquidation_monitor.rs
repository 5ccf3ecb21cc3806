//! Liquidation monitor.
//!
//! Each cycle evaluates every mirrored position against the latest committed
//! prices and submits `liquidate` for positions whose health factor is below
//! the threshold. Submissions run as tracked background tasks; a per-user
//! in-flight guard keeps a user from being liquidated twice before the chain
//! reflects the first attempt.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keeper_api::unix_now;
use keeper_chain::{BroadcastError, ContractMsg, ExecuteMsg, TxBroadcaster};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::DenomConfig;
use crate::error::KeeperError;
use crate::position::{DenomPrice, Position};
use crate::position_store::PositionStore;
use crate::price_cache::PriceCache;

const MEMO: &str = "liquidation";

/// Why a position was or was not liquidated this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    NoDebt,
    /// No fresh price for this denom (or the denom is not mapped)
    MissingPrice(String),
    Healthy(Decimal),
    Liquidatable(Decimal),
}

#[derive(Debug, Clone, Copy)]
enum InFlightState {
    /// Broadcast not finished yet
    Pending,
    /// Accepted (and included at `height` when confirmation is on)
    Submitted { height: u64 },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    state: InFlightState,
    since: Instant,
}

/// Per-user in-flight liquidation marks.
#[derive(Debug)]
pub struct InFlightGuard {
    entries: DashMap<String, InFlight>,
    ttl: Duration,
}

impl InFlightGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Claim `user`. Returns `false` if an attempt for this user is unresolved.
    pub fn try_begin(&self, user: &str) -> bool {
        match self.entries.entry(user.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    state: InFlightState::Pending,
                    since: Instant::now(),
                });
                true
            }
        }
    }

    /// Broadcast accepted; hold the mark until the store catches up to `height`.
    pub fn mark_submitted(&self, user: &str, height: u64) {
        if let Some(mut entry) = self.entries.get_mut(user) {
            entry.state = InFlightState::Submitted { height };
            entry.since = Instant::now();
        }
    }

    pub fn release(&self, user: &str) {
        self.entries.remove(user);
    }

    pub fn contains(&self, user: &str) -> bool {
        self.entries.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop marks whose outcome is now visible in the store, or that outlived the TTL.
    fn reconcile(&self, positions: &BTreeMap<&str, &Position>) {
        let ttl = self.ttl;
        self.entries.retain(|user, entry| match entry.state {
            InFlightState::Pending => true,
            InFlightState::Submitted { height } => {
                let caught_up = positions
                    .get(user.as_str())
                    .map_or(true, |p| p.last_updated_height >= height);
                let expired = entry.since.elapsed() >= ttl;
                if caught_up || expired {
                    debug!(user = %user, caught_up, expired, "Releasing in-flight liquidation");
                }
                !(caught_up || expired)
            }
        });
    }
}

/// Result of one monitor cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub scanned: usize,
    pub healthy: usize,
    pub missing_price: usize,
    pub liquidatable: usize,
    pub submitted: usize,
    pub already_in_flight: usize,
}

/// Monitor settings derived from configuration.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub contract: String,
    pub threshold: Decimal,
    pub staleness_bound: Duration,
    pub denoms: BTreeMap<String, DenomConfig>,
    pub dry_run: bool,
    /// Wait for inclusion so the in-flight mark can be tied to a height
    pub confirm: bool,
    pub in_flight_ttl: Duration,
}

pub struct LiquidationMonitor {
    store: Arc<PositionStore>,
    cache: Arc<PriceCache>,
    broadcaster: Arc<dyn TxBroadcaster>,
    settings: MonitorSettings,
    in_flight: Arc<InFlightGuard>,
    tasks: TaskTracker,
}

impl LiquidationMonitor {
    pub fn new(
        store: Arc<PositionStore>,
        cache: Arc<PriceCache>,
        broadcaster: Arc<dyn TxBroadcaster>,
        settings: MonitorSettings,
    ) -> Self {
        let in_flight = Arc::new(InFlightGuard::new(settings.in_flight_ttl));
        Self {
            store,
            cache,
            broadcaster,
            settings,
            in_flight,
            tasks: TaskTracker::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlightGuard {
        &self.in_flight
    }

    /// Wait for every submitted liquidation task to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn denom_price(
        &self,
        denom: &str,
        prices: &HashMap<String, keeper_api::PriceQuote>,
        now: u64,
    ) -> Option<DenomPrice> {
        let config = self.settings.denoms.get(denom)?;
        let quote = prices.get(&config.asset_id)?;
        if !quote.is_fresh(self.settings.staleness_bound.as_secs(), now) {
            return None;
        }
        Some(DenomPrice {
            usd_price: quote.usd_price,
            decimals: config.decimals,
        })
    }

    /// Classify one position against `prices`.
    pub fn evaluate(
        &self,
        position: &Position,
        prices: &HashMap<String, keeper_api::PriceQuote>,
        now: u64,
    ) -> Evaluation {
        if !position.has_debt() {
            return Evaluation::NoDebt;
        }
        let Some(collateral) = self.denom_price(&position.collateral_denom, prices, now) else {
            return Evaluation::MissingPrice(position.collateral_denom.clone());
        };
        let Some(debt) = self.denom_price(&position.debt_denom, prices, now) else {
            return Evaluation::MissingPrice(position.debt_denom.clone());
        };

        match position.health_factor(collateral, debt) {
            Some(hf) if hf < self.settings.threshold => Evaluation::Liquidatable(hf),
            Some(hf) => Evaluation::Healthy(hf),
            // Overflow or a debt value that rounds to zero
            None => Evaluation::MissingPrice(position.debt_denom.clone()),
        }
    }

    /// Run one monitoring cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> MonitorReport {
        let snapshot = self.store.snapshot();
        let prices = self.cache.snapshot();
        let now = unix_now();

        let by_user: BTreeMap<&str, &Position> =
            snapshot.iter().map(|p| (p.user.as_str(), p)).collect();
        self.in_flight.reconcile(&by_user);

        let mut report = MonitorReport {
            scanned: snapshot.len(),
            ..Default::default()
        };

        for position in &snapshot {
            let hf = match self.evaluate(position, &prices, now) {
                Evaluation::NoDebt => continue,
                Evaluation::MissingPrice(denom) => {
                    report.missing_price += 1;
                    let error = KeeperError::StalePrice(denom);
                    debug!(user = %position.user, error = %error, "Skipping position");
                    continue;
                }
                Evaluation::Healthy(_) => {
                    report.healthy += 1;
                    continue;
                }
                Evaluation::Liquidatable(hf) => hf,
            };

            report.liquidatable += 1;
            if !self.in_flight.try_begin(&position.user) {
                report.already_in_flight += 1;
                debug!(user = %position.user, "Liquidation already in flight");
                continue;
            }

            if self.settings.dry_run {
                info!(
                    user = %position.user,
                    health_factor = %hf,
                    collateral = %position.collateral_amount,
                    debt = %position.debt_amount,
                    "[DRY RUN] Would liquidate"
                );
                self.in_flight.release(&position.user);
                continue;
            }

            info!(
                user = %position.user,
                health_factor = %hf,
                collateral = %format!("{}{}", position.collateral_amount, position.collateral_denom),
                debt = %format!("{}{}", position.debt_amount, position.debt_denom),
                "Submitting liquidation"
            );
            report.submitted += 1;
            self.spawn_liquidation(position.user.clone(), position.last_updated_height);
        }

        info!(
            scanned = report.scanned,
            healthy = report.healthy,
            missing_price = report.missing_price,
            liquidatable = report.liquidatable,
            submitted = report.submitted,
            in_flight = self.in_flight.len(),
            "Monitor cycle complete"
        );
        report
    }

    /// Submit `liquidate` for `user`, whose mirrored position was last updated at `seen_height`.
    fn spawn_liquidation(&self, user: String, seen_height: u64) {
        let broadcaster = self.broadcaster.clone();
        let in_flight = self.in_flight.clone();
        let contract = self.settings.contract.clone();
        let confirm = self.settings.confirm;

        self.tasks.spawn(async move {
            let msg = ContractMsg::new(contract, ExecuteMsg::Liquidate { user: user.clone() });

            let result = match broadcaster.sign_and_broadcast(vec![msg], MEMO).await {
                Ok(result) => result,
                Err(e) => {
                    settle_failure(&in_flight, &user, seen_height, e);
                    return;
                }
            };

            if !confirm {
                // No inclusion height to wait for: any newer event for the user will do
                in_flight.mark_submitted(&user, seen_height.saturating_add(1));
                info!(user = %user, tx_hash = %result.tx_hash, "Liquidation broadcast");
                return;
            }

            match broadcaster.wait_for_commit(&result.tx_hash).await {
                Ok(tx) => {
                    info!(user = %user, tx_hash = %tx.hash, height = tx.height, "Liquidation committed");
                    in_flight.mark_submitted(&user, tx.height);
                }
                Err(e) => settle_failure(&in_flight, &user, seen_height, e),
            }
        });
    }
}

/// Decide what a failed attempt leaves behind in the guard.
///
/// When the transaction may still be included the mark is held until the
/// store shows a newer event for the user or the TTL runs out; a definite
/// rejection frees the user for the next cycle.
fn settle_failure(in_flight: &InFlightGuard, user: &str, seen_height: u64, e: BroadcastError) {
    let unknown = e.outcome_unknown();
    let error = KeeperError::from(e);
    if unknown {
        warn!(user = %user, error = %error, "Liquidation outcome unknown, holding in-flight mark");
        in_flight.mark_submitted(user, seen_height.saturating_add(1));
    } else {
        warn!(user = %user, error = %error, kind = ?error.kind(), "Liquidation failed");
        in_flight.release(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::borrow;
    use crate::testing::FakeBroadcaster;
    use keeper_api::PriceQuote;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    const CONTRACT: &str = "cosmos1lending";

    fn denoms() -> BTreeMap<String, DenomConfig> {
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

    fn settings() -> MonitorSettings {
        MonitorSettings {
            contract: CONTRACT.to_string(),
            threshold: Decimal::ONE,
            staleness_bound: Duration::from_secs(60),
            denoms: denoms(),
            dry_run: false,
            confirm: true,
            in_flight_ttl: Duration::from_secs(300),
        }
    }

    fn setup(
        broadcaster: Arc<FakeBroadcaster>,
        atom_price: &str,
    ) -> (LiquidationMonitor, Arc<PositionStore>, Arc<PriceCache>) {
        let store = Arc::new(PositionStore::new("uusdc"));
        let cache = Arc::new(PriceCache::new());
        set_prices(&cache, atom_price, 0);
        let monitor = LiquidationMonitor::new(store.clone(), cache.clone(), broadcaster, settings());
        (monitor, store, cache)
    }

    fn set_prices(cache: &PriceCache, atom_price: &str, age: u64) {
        let at = unix_now() - age;
        cache.commit([
            PriceQuote::new("cosmos", Decimal::from_str(atom_price).unwrap(), at, "test"),
            PriceQuote::new("usd-coin", Decimal::ONE, at, "test"),
        ]);
    }

    /// 100 collateral units against 150 debt units, 6 decimals each.
    fn open(store: &PositionStore, user: &str, height: u64) {
        store.apply(&borrow(user, height, 100_000_000, 150_000_000));
    }

    #[tokio::test]
    async fn test_healthy_position_is_left_alone() {
        // Scenario A: 100 @ $2 vs 150 @ $1 -> 1.33
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let (monitor, store, _) = setup(broadcaster.clone(), "2");
        open(&store, "alice", 10);

        let report = monitor.run_cycle().await;
        monitor.drain().await;

        assert_eq!(report.healthy, 1);
        assert_eq!(report.submitted, 0);
        assert!(broadcaster.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undercollateralized_position_is_liquidated_once() {
        // Scenario B: 100 @ $1 vs 150 @ $1 -> 0.667
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.commit_height.store(20, Ordering::SeqCst);
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        let position = store.get("alice").unwrap();
        let prices = monitor.cache.snapshot();
        match monitor.evaluate(&position, &prices, unix_now()) {
            Evaluation::Liquidatable(hf) => assert_eq!(hf.round_dp(3), Decimal::from_str("0.667").unwrap()),
            other => panic!("expected liquidatable, got {other:?}"),
        }

        let first = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(first.submitted, 1);

        // The store has not caught up with height 20 yet: no second submission
        let second = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(second.already_in_flight, 1);
        assert_eq!(second.submitted, 0);

        assert_eq!(broadcaster.liquidated_users(), vec!["alice"]);
        assert_eq!(broadcaster.sent.lock()[0][0].contract, CONTRACT);
    }

    #[tokio::test]
    async fn test_mark_clears_once_store_reflects_inclusion() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.commit_height.store(20, Ordering::SeqCst);
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        monitor.run_cycle().await;
        monitor.drain().await;
        assert!(monitor.in_flight().contains("alice"));

        // A partial liquidation lands at height 20 and leaves the position underwater
        store.apply(&borrow("alice", 20, 0, 0));
        let report = monitor.run_cycle().await;
        monitor.drain().await;

        assert_eq!(report.submitted, 1);
        assert_eq!(broadcaster.liquidated_users(), vec!["alice", "alice"]);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_reconsidered_next_cycle() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.fail_next(BroadcastError::Rejected {
            code: 5,
            codespace: "wasm".into(),
            log: "position is healthy".into(),
        });
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        monitor.run_cycle().await;
        monitor.drain().await;
        // One attempt only, no immediate retry
        assert_eq!(broadcaster.sent.lock().len(), 1);
        assert!(!monitor.in_flight().contains("alice"));

        let report = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(report.submitted, 1);
        assert_eq!(broadcaster.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_user_in_flight() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.fail_next(BroadcastError::Transport("connection reset".into()));
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        monitor.run_cycle().await;
        monitor.drain().await;
        assert!(monitor.in_flight().contains("alice"));

        // The first attempt may still be in the mempool
        let second = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(second.already_in_flight, 1);
        assert_eq!(second.submitted, 0);
        assert_eq!(broadcaster.sent.lock().len(), 1);

        // Any newer event for the user settles the attempt
        store.apply(&borrow("alice", 11, 0, 0));
        let third = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(third.submitted, 1);
        assert_eq!(broadcaster.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unconfirmed_liquidation_is_not_resubmitted() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.fail_next_commit(BroadcastError::NotIncluded("TX0".into()));
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        monitor.run_cycle().await;
        monitor.drain().await;
        let second = monitor.run_cycle().await;
        monitor.drain().await;

        assert_eq!(second.already_in_flight, 1);
        assert_eq!(broadcaster.liquidated_users(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_failed_execution_frees_user() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        broadcaster.fail_next_commit(BroadcastError::ExecutionFailed {
            hash: "TX0".into(),
            height: 12,
            code: 5,
            log: "position is healthy".into(),
        });
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        monitor.run_cycle().await;
        monitor.drain().await;
        assert!(!monitor.in_flight().contains("alice"));
    }

    #[tokio::test]
    async fn test_stale_or_missing_prices_never_liquidate() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let (monitor, store, cache) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);
        set_prices(&cache, "1", 3_600);

        let report = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(report.missing_price, 1);

        // Unmapped collateral denom
        let mut odd = borrow("bob", 11, 1, 1_000_000);
        odd.collateral_denom = Some("uunknown".into());
        store.apply(&odd);
        set_prices(&cache, "1", 0);

        let report = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(report.missing_price, 1);
        assert_eq!(broadcaster.liquidated_users(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_only_positions_below_threshold_are_submitted() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let (monitor, store, _) = setup(broadcaster.clone(), "1");

        // collateral/debt ratios around 1.0
        let cases = [("a", 99, 100), ("b", 100, 100), ("c", 101, 100), ("d", 50, 100), ("e", 300, 100)];
        for (user, collateral, debt) in cases {
            store.apply(&borrow(user, 1, collateral * 1_000_000, debt * 1_000_000));
        }

        let report = monitor.run_cycle().await;
        monitor.drain().await;

        assert_eq!(report.liquidatable, 2);
        let mut users = broadcaster.liquidated_users();
        users.sort();
        assert_eq!(users, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn test_dry_run_submits_nothing() {
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let store = Arc::new(PositionStore::new("uusdc"));
        let cache = Arc::new(PriceCache::new());
        set_prices(&cache, "1", 0);
        let monitor = LiquidationMonitor::new(
            store.clone(),
            cache,
            broadcaster.clone(),
            MonitorSettings {
                dry_run: true,
                ..settings()
            },
        );
        open(&store, "alice", 10);

        let report = monitor.run_cycle().await;
        monitor.drain().await;
        assert_eq!(report.liquidatable, 1);
        assert_eq!(report.submitted, 0);
        assert!(broadcaster.sent.lock().is_empty());
        assert!(monitor.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broadcast_does_not_cause_duplicates() {
        let broadcaster = Arc::new(FakeBroadcaster::slow(Duration::from_secs(90)));
        let (monitor, store, _) = setup(broadcaster.clone(), "1");
        open(&store, "alice", 10);

        // Two cycles while the first broadcast is still pending
        monitor.run_cycle().await;
        let second = monitor.run_cycle().await;
        assert_eq!(second.already_in_flight, 1);

        monitor.drain().await;
        assert_eq!(broadcaster.sent.lock().len(), 1);
    }

    #[test]
    fn test_guard_ttl_expiry() {
        let guard = InFlightGuard::new(Duration::ZERO);
        assert!(guard.try_begin("alice"));
        assert!(!guard.try_begin("alice"));

        guard.mark_submitted("alice", u64::MAX);
        let position = Position::new("alice", "uusdc");
        let positions = BTreeMap::from([("alice", &position)]);
        guard.reconcile(&positions);
        assert!(guard.is_empty());
    }
}
