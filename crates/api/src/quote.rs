//! Price quote type shared by the aggregator, the feeder and the monitor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A USD price observation for one tracked asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Price-source asset identifier (e.g. `bitcoin`, `cosmos`)
    pub asset_id: String,
    /// USD price
    pub usd_price: Decimal,
    /// Unix seconds at which the source observed this price
    pub observed_at: u64,
    /// Source name
    pub source: String,
}

impl PriceQuote {
    pub fn new(
        asset_id: impl Into<String>,
        usd_price: Decimal,
        observed_at: u64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            usd_price,
            observed_at,
            source: source.into(),
        }
    }

    /// Age in seconds relative to `now` (zero for quotes stamped in the future).
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.observed_at)
    }

    /// `observed_at >= now - staleness_bound`.
    pub fn is_fresh(&self, staleness_bound_secs: u64, now: u64) -> bool {
        self.age_secs(now) <= staleness_bound_secs
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_boundary() {
        let quote = PriceQuote::new("bitcoin", Decimal::new(65_000, 0), 1_700_000_000, "test");

        assert!(quote.is_fresh(60, 1_700_000_060));
        assert!(!quote.is_fresh(60, 1_700_000_061));
        // Clock skew from the source never makes a quote stale
        assert!(quote.is_fresh(60, 1_699_999_000));
        assert_eq!(quote.age_secs(1_699_999_000), 0);
    }
}
