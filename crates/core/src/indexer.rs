//! Event indexer: keeps the position store in step with contract events.

use futures::StreamExt;
use keeper_api::ExponentialBackoff;
use keeper_chain::{decode_tx, TxEventSource, TxEvents};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::position_store::{ApplyOutcome, PositionStore};

#[derive(Debug, Default)]
pub struct IndexerStats {
    pub applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub reconnects: AtomicU64,
    /// Transactions replayed by catch-up searches
    pub backfilled: AtomicU64,
    /// Highest height of any handled transaction
    pub last_height: AtomicU64,
}

pub struct EventIndexer {
    source: Arc<dyn TxEventSource>,
    store: Arc<PositionStore>,
    contract: String,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    start_height: Option<u64>,
    stats: IndexerStats,
}

impl EventIndexer {
    pub fn new(
        source: Arc<dyn TxEventSource>,
        store: Arc<PositionStore>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            contract: contract.into(),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            start_height: None,
            stats: IndexerStats::default(),
        }
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    /// Replay history from `height` before the first live event.
    pub fn with_start_height(mut self, height: Option<u64>) -> Self {
        self.start_height = height;
        self
    }

    pub fn stats(&self) -> &IndexerStats {
        &self.stats
    }

    /// Apply every lending event of one transaction. Returns how many changed the store.
    pub fn handle_tx(&self, tx: &TxEvents) -> usize {
        self.stats.last_height.fetch_max(tx.height, Ordering::Relaxed);

        let mut changed = 0;
        for decoded in decode_tx(tx, &self.contract) {
            let event = match decoded {
                Ok(event) => event,
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(tx_hash = %tx.tx_hash, height = tx.height, error = %e, "Skipping malformed event");
                    continue;
                }
            };

            match self.store.apply(&event) {
                ApplyOutcome::Duplicate => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(user = %event.user, height = event.height(), "Ignoring replayed event");
                }
                ApplyOutcome::Rejected => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                }
                outcome => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    changed += 1;
                    debug!(
                        user = %event.user,
                        kind = event.kind.as_str(),
                        height = event.height(),
                        created = outcome == ApplyOutcome::Created,
                        "Applied event"
                    );
                }
            }
        }
        changed
    }

    /// Height to replay from after (re)subscribing, if any.
    ///
    /// The last seen height itself is searched again: a block may have been
    /// cut off midway, and replays are ignored by event id.
    fn resume_height(&self) -> Option<u64> {
        match self.stats.last_height.load(Ordering::Relaxed) {
            0 => self.start_height,
            height => Some(height),
        }
    }

    /// Apply transactions missed while no subscription was active.
    async fn catch_up(&self, from_height: u64) -> anyhow::Result<()> {
        let txs = self.source.backfill(from_height).await?;
        let changed: usize = txs.iter().map(|tx| self.handle_tx(tx)).sum();
        self.stats
            .backfilled
            .fetch_add(txs.len() as u64, Ordering::Relaxed);
        info!(from_height, txs = txs.len(), changed, "Caught up on contract transactions");
        Ok(())
    }

    /// Consume events until cancelled, resubscribing with backoff whenever the
    /// stream ends or the subscription fails.
    ///
    /// Each new subscription is opened before the catch-up search runs, so
    /// nothing committed in between is missed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff =
            ExponentialBackoff::new(self.reconnect_initial, self.reconnect_max, 2, None);

        info!(contract = %self.contract, "Event indexer started");

        while !cancel.is_cancelled() {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.subscribe() => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    let caught_up = match self.resume_height() {
                        Some(height) => tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = self.catch_up(height) => result,
                        },
                        None => Ok(()),
                    };

                    match caught_up {
                        Ok(()) => {
                            backoff.reset();
                            loop {
                                let next = tokio::select! {
                                    _ = cancel.cancelled() => None,
                                    tx = stream.next() => tx,
                                };
                                let Some(tx) = next else { break };
                                self.handle_tx(&tx);
                            }
                            if cancel.is_cancelled() {
                                break;
                            }
                            warn!("Event stream ended");
                        }
                        Err(e) => error!(error = %e, "Catch-up failed, dropping subscription"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Event subscription failed");
                }
            }

            let delay = backoff.next_delay().unwrap_or(self.reconnect_max);
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(delay_ms = delay.as_millis() as u64, "Resubscribing to events");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            applied = self.stats.applied.load(Ordering::Relaxed),
            reconnects = self.stats.reconnects.load(Ordering::Relaxed),
            last_height = self.stats.last_height.load(Ordering::Relaxed),
            "Event indexer stopped"
        );
    }
}
