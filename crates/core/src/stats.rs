//! Periodic summary of every service counter.

use keeper_chain::AccountSigner;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

use crate::indexer::EventIndexer;
use crate::liquidation_monitor::LiquidationMonitor;
use crate::oracle_feeder::OracleFeeder;
use crate::position_store::PositionStore;
use crate::price_cache::PriceCache;
use crate::scheduler::SchedulerStats;

/// Handles to the counters of the running services. Disabled services stay `None`.
pub struct StatsReporter {
    pub store: Arc<PositionStore>,
    pub cache: Arc<PriceCache>,
    pub signer: Option<Arc<AccountSigner>>,
    pub feeder: Option<Arc<OracleFeeder>>,
    pub indexer: Option<Arc<EventIndexer>>,
    pub monitor: Option<Arc<LiquidationMonitor>>,
    pub schedulers: Vec<(&'static str, Arc<SchedulerStats>)>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub positions: usize,
    pub open_positions: usize,
    pub prices: usize,
    pub broadcasts: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub resyncs: u64,
    pub feeder_cycles: u64,
    pub feeder_committed: u64,
    pub feeder_failed: u64,
    pub events_applied: u64,
    pub events_malformed: u64,
    pub reconnects: u64,
    pub backfilled: u64,
    pub last_height: u64,
    pub in_flight: usize,
    /// Ticks skipped because the previous run was still going, summed over jobs
    pub skipped_ticks: u64,
}

impl StatsReporter {
    pub fn new(store: Arc<PositionStore>, cache: Arc<PriceCache>) -> Self {
        Self {
            store,
            cache,
            signer: None,
            feeder: None,
            indexer: None,
            monitor: None,
            schedulers: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            positions: self.store.len(),
            open_positions: self.store.open_count(),
            prices: self.cache.len(),
            ..Default::default()
        };

        if let Some(signer) = &self.signer {
            let stats = signer.stats();
            snapshot.broadcasts = stats.broadcasts.load(Ordering::Relaxed);
            snapshot.accepted = stats.accepted.load(Ordering::Relaxed);
            snapshot.rejected = stats.rejected.load(Ordering::Relaxed);
            snapshot.resyncs = stats.resyncs.load(Ordering::Relaxed);
        }
        if let Some(feeder) = &self.feeder {
            let stats = feeder.stats();
            snapshot.feeder_cycles = stats.cycles.load(Ordering::Relaxed);
            snapshot.feeder_committed = stats.committed.load(Ordering::Relaxed);
            snapshot.feeder_failed = stats.failed.load(Ordering::Relaxed);
        }
        if let Some(indexer) = &self.indexer {
            let stats = indexer.stats();
            snapshot.events_applied = stats.applied.load(Ordering::Relaxed);
            snapshot.events_malformed = stats.malformed.load(Ordering::Relaxed);
            snapshot.reconnects = stats.reconnects.load(Ordering::Relaxed);
            snapshot.backfilled = stats.backfilled.load(Ordering::Relaxed);
            snapshot.last_height = stats.last_height.load(Ordering::Relaxed);
        }
        if let Some(monitor) = &self.monitor {
            snapshot.in_flight = monitor.in_flight().len();
        }
        snapshot.skipped_ticks = self
            .schedulers
            .iter()
            .map(|(_, stats)| stats.skipped.load(Ordering::Relaxed))
            .sum();

        snapshot
    }

    /// Emit one summary line.
    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            positions = s.positions,
            open = s.open_positions,
            prices = s.prices,
            broadcasts = s.broadcasts,
            accepted = s.accepted,
            rejected = s.rejected,
            resyncs = s.resyncs,
            feeder_cycles = s.feeder_cycles,
            feeder_committed = s.feeder_committed,
            feeder_failed = s.feeder_failed,
            events_applied = s.events_applied,
            events_malformed = s.events_malformed,
            reconnects = s.reconnects,
            backfilled = s.backfilled,
            last_height = s.last_height,
            in_flight = s.in_flight,
            skipped_ticks = s.skipped_ticks,
            "Keeper stats"
        );
        for (job, stats) in &self.schedulers {
            info!(
                job = *job,
                runs = stats.runs.load(Ordering::Relaxed),
                skipped = stats.skipped.load(Ordering::Relaxed),
                "Scheduler stats"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::borrow;
    use crate::position::Position;
    use keeper_api::PriceQuote;
    use rust_decimal::Decimal;

    #[test]
    fn test_snapshot_reads_store_cache_and_schedulers() {
        let store = Arc::new(PositionStore::new("uusdc"));
        store.apply(&borrow("cosmos1alice", 10, 1_000, 500));
        store.upsert(Position::new("cosmos1bob", "uusdc"));
        let cache = Arc::new(PriceCache::new());
        cache.commit([PriceQuote::new("cosmos", Decimal::from(8), 100, "test")]);

        let feeder_ticks = Arc::new(SchedulerStats::default());
        feeder_ticks.skipped.store(2, Ordering::Relaxed);
        let monitor_ticks = Arc::new(SchedulerStats::default());
        monitor_ticks.skipped.store(1, Ordering::Relaxed);

        let mut reporter = StatsReporter::new(store, cache);
        reporter.schedulers = vec![("feeder", feeder_ticks), ("monitor", monitor_ticks)];

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.positions, 2);
        assert_eq!(snapshot.open_positions, 1);
        assert_eq!(snapshot.prices, 1);
        assert_eq!(snapshot.skipped_ticks, 3);
        // Disabled services report zeros
        assert_eq!(snapshot.broadcasts, 0);
        assert_eq!(snapshot.last_height, 0);
    }
}
