//! Keeper API clients for external services.
//!
//! This crate provides:
//! - CoinGecko: USD price aggregation for tracked assets
//! - Bounded exponential backoff shared by retrying clients

pub mod backoff;
mod coingecko;
mod quote;

pub use backoff::{retry, ExponentialBackoff, RetryPolicy, Transient};
pub use coingecko::{
    parse_simple_price, CoinGeckoClient, FetchError, PriceSource, PRO_API_URL, PUBLIC_API_URL,
};
pub use quote::{unix_now, PriceQuote};
