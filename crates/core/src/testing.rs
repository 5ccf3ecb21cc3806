//! In-memory fakes of the price and chain seams.

use async_trait::async_trait;
use keeper_api::{PriceQuote, PriceSource};
use keeper_chain::{
    BroadcastError, BroadcastResult, ContractMsg, ExecuteMsg, TxBroadcaster, TxResult,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeSource {
    pub quotes: Mutex<HashMap<String, PriceQuote>>,
    pub requests: Mutex<Vec<BTreeSet<String>>>,
}

impl FakeSource {
    pub fn with(quotes: impl IntoIterator<Item = PriceQuote>) -> Self {
        Self {
            quotes: Mutex::new(quotes.into_iter().map(|q| (q.asset_id.clone(), q)).collect()),
            requests: Mutex::default(),
        }
    }
}

#[async_trait]
impl PriceSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_prices(&self, asset_ids: &BTreeSet<String>) -> HashMap<String, PriceQuote> {
        self.requests.lock().push(asset_ids.clone());
        let quotes = self.quotes.lock();
        asset_ids
            .iter()
            .filter_map(|id| quotes.get(id).map(|q| (id.clone(), q.clone())))
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct FakeBroadcaster {
    pub sent: Mutex<Vec<Vec<ContractMsg>>>,
    pub fail_with: Mutex<Option<BroadcastError>>,
    pub commit_fail_with: Mutex<Option<BroadcastError>>,
    pub commit_height: AtomicU64,
    pub delay: Option<Duration>,
    sequence: AtomicU64,
}

impl FakeBroadcaster {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, error: BroadcastError) {
        *self.fail_with.lock() = Some(error);
    }

    pub fn fail_next_commit(&self, error: BroadcastError) {
        *self.commit_fail_with.lock() = Some(error);
    }

    /// Users named in every liquidation sent so far, in order.
    pub fn liquidated_users(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .flatten()
            .filter_map(|m| match &m.msg {
                ExecuteMsg::Liquidate { user } => Some(user.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TxBroadcaster for FakeBroadcaster {
    async fn sign_and_broadcast(
        &self,
        msgs: Vec<ContractMsg>,
        _memo: &str,
    ) -> Result<BroadcastResult, BroadcastError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(msgs);
        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(BroadcastResult {
            tx_hash: format!("TX{sequence}"),
            sequence,
            log: String::new(),
        })
    }

    async fn wait_for_commit(&self, tx_hash: &str) -> Result<TxResult, BroadcastError> {
        if let Some(error) = self.commit_fail_with.lock().take() {
            return Err(error);
        }
        Ok(TxResult {
            hash: tx_hash.to_string(),
            height: self.commit_height.load(Ordering::SeqCst),
            code: 0,
            log: String::new(),
        })
    }
}
