//! WebSocket subscription to the lending contract's transaction events.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tendermint_rpc::event::{Event, EventData};
use tendermint_rpc::query::{EventType, Query};
use tendermint_rpc::{SubscriptionClient, WebSocketClient};
use tracing::{info, warn};

use crate::events::TxEvents;
use crate::rpc::{raw_event, RpcClient};

/// A source of delivered transactions, one subscription at a time.
///
/// The returned stream ends when the underlying connection is lost; callers
/// resubscribe and use [`TxEventSource::backfill`] to cover the gap.
#[async_trait]
pub trait TxEventSource: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'static, TxEvents>>;

    /// Successful transactions at or above `from_height`, oldest first.
    async fn backfill(&self, from_height: u64) -> Result<Vec<TxEvents>>;
}

/// CometBFT websocket listener filtered to one contract.
pub struct EventListener {
    ws_url: String,
    contract: String,
    rpc: Arc<RpcClient>,
}

impl EventListener {
    pub fn new(ws_url: impl Into<String>, contract: impl Into<String>, rpc: Arc<RpcClient>) -> Self {
        Self {
            ws_url: ws_url.into(),
            contract: contract.into(),
            rpc,
        }
    }

    /// Subscription query for every transaction touching the contract.
    pub fn query(&self) -> Query {
        Query::from(EventType::Tx).and_eq("wasm._contract_address", self.contract.as_str())
    }
}

#[async_trait]
impl TxEventSource for EventListener {
    async fn subscribe(&self) -> Result<BoxStream<'static, TxEvents>> {
        info!(ws_url = %self.ws_url, contract = %self.contract, "Subscribing to contract events");

        let (client, driver) = WebSocketClient::new(self.ws_url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;
        let driver = tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                warn!(error = %e, "WebSocket driver stopped");
            }
        });

        let subscription = match client.subscribe(self.query()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                driver.abort();
                return Err(e).context("Subscription rejected");
            }
        };
        info!("Contract event subscription active");

        // Client and driver live in the stream state so the connection stays open
        let stream = futures::stream::unfold(
            (client, subscription, driver),
            |(client, mut subscription, driver)| async move {
                loop {
                    match subscription.next().await {
                        Some(Ok(event)) => match tx_from_event(event) {
                            Some(tx) => return Some((tx, (client, subscription, driver))),
                            None => continue,
                        },
                        Some(Err(e)) => {
                            warn!(error = %e, "Subscription error");
                            break;
                        }
                        None => {
                            warn!("WebSocket subscription closed by node");
                            break;
                        }
                    }
                }
                let _ = client.close();
                driver.abort();
                None
            },
        );

        Ok(stream.boxed())
    }

    async fn backfill(&self, from_height: u64) -> Result<Vec<TxEvents>> {
        self.rpc
            .search_contract_txs(&self.contract, from_height)
            .await
            .with_context(|| format!("Failed to search transactions from height {from_height}"))
    }
}

/// The delivered transaction carried by a subscription event, if any.
fn tx_from_event(event: Event) -> Option<TxEvents> {
    let EventData::Tx { tx_result } = event.data else {
        return None;
    };
    let tx_hash = event
        .events
        .as_ref()
        .and_then(|index| index.get("tx.hash"))
        .and_then(|hashes| hashes.first())
        .cloned()
        .unwrap_or_default();

    Some(TxEvents {
        height: u64::try_from(tx_result.height).unwrap_or_default(),
        tx_index: tx_result.index.map_or(0, |i| i as u32),
        tx_hash,
        events: tx_result.result.events.iter().map(raw_event).collect(),
    })
}
