//! Read-only HTTP API over the keeper's mirrored state.
//!
//! Serves committed prices, the denom markets the monitor knows about, and
//! mirrored positions. Account queries are passed through to the lending
//! contract.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use keeper_api::{unix_now, PriceQuote};
use keeper_chain::{ContractQuerier, QueryMsg};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DenomConfig;
use crate::position::{DenomPrice, Position};
use crate::position_store::PositionStore;
use crate::price_cache::PriceCache;

#[derive(Debug, Error)]
enum ApiError {
    #[error("no fresh price for {0}")]
    NoPrice(String),
    #[error("contract queries are not available")]
    NoQuerier,
    #[error("contract query failed: {0}")]
    Upstream(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NoPrice(_) => StatusCode::NOT_FOUND,
            Self::NoQuerier => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state of every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<PositionStore>,
    pub cache: Arc<PriceCache>,
    pub querier: Option<Arc<dyn ContractQuerier>>,
    pub contract: String,
    pub denoms: BTreeMap<String, DenomConfig>,
    pub staleness_bound: Duration,
}

impl ApiState {
    fn denom_price(&self, denom: &str, now: u64) -> Option<DenomPrice> {
        let config = self.denoms.get(denom)?;
        let quote = self
            .cache
            .fresh(&config.asset_id, self.staleness_bound.as_secs(), now)?;
        Some(DenomPrice {
            usd_price: quote.usd_price,
            decimals: config.decimals,
        })
    }

    async fn query(&self, query: QueryMsg) -> Result<Json<Value>, ApiError> {
        let querier = self.querier.as_ref().ok_or(ApiError::NoQuerier)?;
        querier
            .query_contract(&self.contract, &query)
            .await
            .map(Json)
            .map_err(|e| {
                warn!(error = %e, "Contract query failed");
                ApiError::Upstream(e.to_string())
            })
    }
}

#[derive(Debug, Serialize)]
struct MarketView {
    denom: String,
    asset_id: String,
    decimals: u32,
    usd_price: Option<Decimal>,
    observed_at: Option<u64>,
    fresh: bool,
}

#[derive(Debug, Serialize)]
struct PositionView {
    user: String,
    collateral_denom: String,
    collateral_amount: Decimal,
    debt_denom: String,
    debt_amount: Decimal,
    last_updated_height: u64,
    /// `None` without debt or without fresh prices for both denoms
    health_factor: Option<Decimal>,
}

impl PositionView {
    fn new(position: Position, state: &ApiState, now: u64) -> Self {
        let health_factor = match (
            state.denom_price(&position.collateral_denom, now),
            state.denom_price(&position.debt_denom, now),
        ) {
            (Some(collateral), Some(debt)) => position.health_factor(collateral, debt),
            _ => None,
        };
        Self {
            user: position.user,
            collateral_denom: position.collateral_denom,
            collateral_amount: position.collateral_amount,
            debt_denom: position.debt_denom,
            debt_amount: position.debt_amount,
            last_updated_height: position.last_updated_height,
            health_factor,
        }
    }
}

/// Routes of the read API.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({ "ok": true })) }))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/prices", get(prices))
        .route("/api/v1/prices/{asset_id}", get(price))
        .route("/api/v1/user/{address}/positions", get(positions))
        .route("/api/v1/user/{address}/account", get(account))
        .route("/api/v1/max_withdrawable/{denom}", get(max_withdrawable))
        .with_state(state)
}

/// Serve the read API on `addr` until `cancel` fires.
pub async fn serve(addr: &str, state: ApiState, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status API on {addr}"))?;
    info!(addr = %listener.local_addr()?, "Status API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Status API server failed")?;

    info!("Status API stopped");
    Ok(())
}

async fn markets(State(state): State<ApiState>) -> Json<Vec<MarketView>> {
    let now = unix_now();
    let prices = state.cache.snapshot();
    let bound = state.staleness_bound.as_secs();

    let markets = state
        .denoms
        .iter()
        .map(|(denom, config)| {
            let quote = prices.get(&config.asset_id);
            MarketView {
                denom: denom.clone(),
                asset_id: config.asset_id.clone(),
                decimals: config.decimals,
                usd_price: quote.map(|q| q.usd_price),
                observed_at: quote.map(|q| q.observed_at),
                fresh: quote.is_some_and(|q| q.is_fresh(bound, now)),
            }
        })
        .collect();
    Json(markets)
}

async fn prices(State(state): State<ApiState>) -> Json<Vec<PriceQuote>> {
    let mut quotes: Vec<PriceQuote> = state.cache.snapshot().values().cloned().collect();
    quotes.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
    Json(quotes)
}

async fn price(
    State(state): State<ApiState>,
    Path(asset_id): Path<String>,
) -> Result<Json<PriceQuote>, ApiError> {
    state
        .cache
        .fresh(&asset_id, state.staleness_bound.as_secs(), unix_now())
        .map(Json)
        .ok_or(ApiError::NoPrice(asset_id))
}

async fn positions(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Json<Vec<PositionView>> {
    let now = unix_now();
    let views = state
        .store
        .get(&address)
        .map(|p| PositionView::new(p, &state, now))
        .into_iter()
        .collect();
    Json(views)
}

async fn account(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.query(QueryMsg::GetAccount { address }).await
}

async fn max_withdrawable(
    State(state): State<ApiState>,
    Path(denom): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .query(QueryMsg::MaxWithdrawableAmount { token_denom: denom })
        .await
}
