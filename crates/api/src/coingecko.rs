//! CoinGecko simple-price client used as the feeder's price aggregator.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry, RetryPolicy, Transient};
use crate::quote::{unix_now, PriceQuote};

/// Public API base URL.
pub const PUBLIC_API_URL: &str = "https://api.coingecko.com/api/v3";
/// Pro API base URL.
pub const PRO_API_URL: &str = "https://pro-api.coingecko.com/api/v3";

const SOURCE_NAME: &str = "coingecko";

/// Anything that can price a set of asset ids.
///
/// Implementations never fail the whole batch: assets without usable data
/// are simply absent from the returned map.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_prices(&self, asset_ids: &BTreeSet<String>) -> HashMap<String, PriceQuote>;
}

/// Price fetch failure for one request attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("request rejected: HTTP {0}")]
    Client(u16),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connect(_) | Self::RateLimited | Self::Server(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            classify_status(status.as_u16())
        } else {
            Self::Connect(e.to_string())
        }
    }
}

fn classify_status(status: u16) -> FetchError {
    match status {
        429 => FetchError::RateLimited,
        500..=599 => FetchError::Server(status),
        _ => FetchError::Client(status),
    }
}

/// CoinGecko `simple/price` client.
#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl CoinGeckoClient {
    /// Create a client. A pro base URL switches the API key header accordingly.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_timeout(base_url, api_key, Duration::from_secs(10))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn key_header(&self) -> &'static str {
        if self.base_url.contains("pro-api") {
            "x-cg-pro-api-key"
        } else {
            "x-cg-demo-api-key"
        }
    }

    async fn fetch_once(&self, ids: &str) -> Result<Map<String, Value>, FetchError> {
        let url = format!("{}/simple/price", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .query(&[
                ("ids", ids),
                ("vs_currencies", "usd"),
                ("include_last_updated_at", "true"),
            ]);

        if let Some(key) = &self.api_key {
            request = request.header(self.key_header(), key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }

        match response.json::<Value>().await? {
            Value::Object(map) => Ok(map),
            other => Err(FetchError::Decode(format!("expected object, got {other}"))),
        }
    }
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[instrument(skip(self, asset_ids), fields(requested = asset_ids.len()))]
    async fn fetch_prices(&self, asset_ids: &BTreeSet<String>) -> HashMap<String, PriceQuote> {
        if asset_ids.is_empty() {
            return HashMap::new();
        }

        let ids = asset_ids.iter().map(String::as_str).collect::<Vec<_>>().join(",");

        let body = match retry(self.retry, SOURCE_NAME, || self.fetch_once(&ids)).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Price fetch failed, returning empty batch");
                return HashMap::new();
            }
        };

        let quotes = parse_simple_price(&body, asset_ids, unix_now());
        info!(
            requested = asset_ids.len(),
            priced = quotes.len(),
            "Fetched prices"
        );
        quotes
    }
}

/// Turn a `simple/price` body into quotes, dropping assets without usable data.
pub fn parse_simple_price(
    body: &Map<String, Value>,
    asset_ids: &BTreeSet<String>,
    fetched_at: u64,
) -> HashMap<String, PriceQuote> {
    let mut quotes = HashMap::with_capacity(asset_ids.len());

    for asset_id in asset_ids {
        let Some(entry) = body.get(asset_id).and_then(Value::as_object) else {
            debug!(asset = %asset_id, "No price data returned");
            continue;
        };

        let Some(price) = entry.get("usd").and_then(parse_decimal) else {
            debug!(asset = %asset_id, "Missing or unparsable usd price");
            continue;
        };

        if price <= Decimal::ZERO {
            warn!(asset = %asset_id, price = %price, "Ignoring non-positive price");
            continue;
        }

        let observed_at = entry
            .get("last_updated_at")
            .and_then(Value::as_u64)
            .unwrap_or(fetched_at);

        quotes.insert(
            asset_id.clone(),
            PriceQuote::new(asset_id.clone(), price, observed_at, SOURCE_NAME),
        );
    }

    quotes
}

/// Parse a JSON number without going through `f64`.
fn parse_decimal(value: &Value) -> Option<Decimal> {
    let Value::Number(n) = value else {
        return None;
    };
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
