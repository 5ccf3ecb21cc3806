//! Latest committed prices, shared by the feeder and the monitor.

use keeper_api::PriceQuote;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Whole-map price cache.
///
/// Readers get an `Arc` to an immutable map; a commit builds the next map
/// and swaps it in, so a reader never sees half of a feeder cycle.
#[derive(Default)]
pub struct PriceCache {
    quotes: RwLock<Arc<HashMap<String, PriceQuote>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `committed` over the current map and publish the result.
    pub fn commit(&self, committed: impl IntoIterator<Item = PriceQuote>) {
        let mut guard = self.quotes.write();
        let mut next = HashMap::clone(&guard);
        for quote in committed {
            next.insert(quote.asset_id.clone(), quote);
        }
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, PriceQuote>> {
        self.quotes.read().clone()
    }

    /// Quote for `asset_id` if it is no older than `staleness_bound_secs`.
    pub fn fresh(&self, asset_id: &str, staleness_bound_secs: u64, now: u64) -> Option<PriceQuote> {
        self.quotes
            .read()
            .get(asset_id)
            .filter(|q| q.is_fresh(staleness_bound_secs, now))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn quote(asset: &str, price: i64, at: u64) -> PriceQuote {
        PriceQuote::new(asset, Decimal::from(price), at, "test")
    }

    #[test]
    fn test_commit_merges_and_replaces() {
        let cache = PriceCache::new();
        cache.commit([quote("bitcoin", 60_000, 100), quote("cosmos", 8, 100)]);

        let before = cache.snapshot();
        cache.commit([quote("cosmos", 9, 130)]);

        // Earlier snapshot is untouched
        assert_eq!(before["cosmos"].usd_price, Decimal::from(8));
        let after = cache.snapshot();
        assert_eq!(after["cosmos"].usd_price, Decimal::from(9));
        assert_eq!(after["bitcoin"].usd_price, Decimal::from(60_000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fresh_filters_stale() {
        let cache = PriceCache::new();
        cache.commit([quote("bitcoin", 60_000, 100)]);

        assert!(cache.fresh("bitcoin", 60, 160).is_some());
        assert!(cache.fresh("bitcoin", 60, 161).is_none());
        assert!(cache.fresh("ethereum", 60, 100).is_none());
    }
}
