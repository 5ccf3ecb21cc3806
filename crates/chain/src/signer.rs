//! Account signer: the single owner of the keeper account's sequence.
//!
//! Every transaction the keeper sends goes through [`AccountSigner`]. The
//! account state sits behind an async mutex that is held for the whole
//! build/sign/broadcast call, so no two transactions ever claim the same
//! sequence and a successful broadcast advances it by exactly one.

use async_trait::async_trait;
use prost::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::keys::SigningKey;
use crate::messages::ContractMsg;
use crate::proto::{
    Any, AuthInfo, Coin, Fee, ModeInfo, ModeInfoSingle, MsgExecuteContract, PubKey, SignDoc,
    SignerInfo, TxBody, TxRaw, MSG_EXECUTE_CONTRACT_TYPE_URL, SECP256K1_PUBKEY_TYPE_URL,
    SIGN_MODE_DIRECT,
};
use crate::rpc::{ChainClient, RpcError, TxResult};

/// `ErrWrongSequence` in the `sdk` codespace.
const SEQUENCE_MISMATCH_CODE: u32 = 32;

/// Broadcast failure as seen by callers.
#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    /// The broadcast call itself failed; the transaction may or may not be in the mempool.
    #[error("broadcast transport failure: {0}")]
    Transport(String),
    /// Still a sequence mismatch after one resync and retry.
    #[error("account sequence mismatch after resync (sent {sent})")]
    SequenceMismatch { sent: u64, log: String },
    /// CheckTx rejected the transaction.
    #[error("transaction rejected: code {code} ({codespace}): {log}")]
    Rejected {
        code: u32,
        codespace: String,
        log: String,
    },
    /// Included in a block but DeliverTx failed.
    #[error("transaction {hash} failed at height {height}: code {code}: {log}")]
    ExecutionFailed {
        hash: String,
        height: u64,
        code: u32,
        log: String,
    },
    #[error("transaction {0} not included before timeout")]
    NotIncluded(String),
    #[error("could not encode transaction: {0}")]
    Encode(String),
}

impl BroadcastError {
    /// The transaction may still land: the node never answered or inclusion was not observed in time.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotIncluded(_))
    }
}

/// Accepted broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub tx_hash: String,
    /// Sequence the transaction was signed with
    pub sequence: u64,
    pub log: String,
}

/// Fee attached to every transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeConfig {
    pub denom: String,
    pub amount: u128,
    pub gas_limit: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            denom: "uatom".to_string(),
            amount: 5_000,
            gas_limit: 500_000,
        }
    }
}

/// Anything that can put contract messages on chain for the keeper.
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    async fn sign_and_broadcast(
        &self,
        msgs: Vec<ContractMsg>,
        memo: &str,
    ) -> Result<BroadcastResult, BroadcastError>;

    /// Wait until `tx_hash` is included and report its execution result.
    async fn wait_for_commit(&self, tx_hash: &str) -> Result<TxResult, BroadcastError>;
}

/// The keeper account as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub address: String,
    pub public_key: Vec<u8>,
    pub account_number: u64,
    pub sequence: u64,
}

/// Signer counters.
#[derive(Debug, Default)]
pub struct SignerStats {
    pub broadcasts: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub resyncs: AtomicU64,
}

/// Serialized signer and broadcaster for one account.
pub struct AccountSigner {
    client: Arc<dyn ChainClient>,
    key: SigningKey,
    chain_id: String,
    fee: FeeConfig,
    account: Mutex<Account>,
    commit_timeout: Duration,
    commit_poll: Duration,
    stats: SignerStats,
}

impl AccountSigner {
    /// Load the account from chain. Fails when the chain is unreachable or the account does not exist.
    pub async fn connect(
        client: Arc<dyn ChainClient>,
        key: SigningKey,
        prefix: &str,
        fee: FeeConfig,
    ) -> anyhow::Result<Self> {
        let address = key.address(prefix)?;
        let chain_id = client.chain_id().await?;
        let state = client.account(&address).await?;

        info!(
            address = %address,
            chain_id = %chain_id,
            account_number = state.account_number,
            sequence = state.sequence,
            "Account signer initialized"
        );

        let account = Account {
            address,
            public_key: key.public_key().to_vec(),
            account_number: state.account_number,
            sequence: state.sequence,
        };
        Ok(Self::from_parts(client, key, chain_id, fee, account))
    }

    pub fn from_parts(
        client: Arc<dyn ChainClient>,
        key: SigningKey,
        chain_id: String,
        fee: FeeConfig,
        account: Account,
    ) -> Self {
        Self {
            client,
            key,
            chain_id,
            fee,
            account: Mutex::new(account),
            commit_timeout: Duration::from_secs(60),
            commit_poll: Duration::from_secs(2),
            stats: SignerStats::default(),
        }
    }

    pub fn with_commit_timing(mut self, timeout: Duration, poll: Duration) -> Self {
        self.commit_timeout = timeout;
        self.commit_poll = poll;
        self
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn stats(&self) -> &SignerStats {
        &self.stats
    }

    /// Snapshot of the local account state (waits for any in-flight broadcast).
    pub async fn account(&self) -> Account {
        self.account.lock().await.clone()
    }

    fn build_tx(&self, account: &Account, msgs: &[ContractMsg], memo: &str) -> Result<Vec<u8>, BroadcastError> {
        let mut messages = Vec::with_capacity(msgs.len());
        for m in msgs {
            let payload =
                serde_json::to_vec(&m.msg).map_err(|e| BroadcastError::Encode(e.to_string()))?;
            let execute = MsgExecuteContract {
                sender: account.address.clone(),
                contract: m.contract.clone(),
                msg: payload,
                funds: m.funds.clone(),
            };
            messages.push(Any::pack(MSG_EXECUTE_CONTRACT_TYPE_URL, &execute));
        }

        let body = TxBody {
            messages,
            memo: memo.to_string(),
            timeout_height: 0,
        };
        let auth_info = AuthInfo {
            signer_infos: vec![SignerInfo {
                public_key: Some(Any::pack(
                    SECP256K1_PUBKEY_TYPE_URL,
                    &PubKey {
                        key: account.public_key.clone(),
                    },
                )),
                mode_info: Some(ModeInfo {
                    single: Some(ModeInfoSingle {
                        mode: SIGN_MODE_DIRECT,
                    }),
                }),
                sequence: account.sequence,
            }],
            fee: Some(Fee {
                amount: vec![Coin {
                    denom: self.fee.denom.clone(),
                    amount: self.fee.amount.to_string(),
                }],
                gas_limit: self.fee.gas_limit,
                payer: String::new(),
                granter: String::new(),
            }),
        };

        let body_bytes = body.encode_to_vec();
        let auth_info_bytes = auth_info.encode_to_vec();
        let sign_doc = SignDoc {
            body_bytes: body_bytes.clone(),
            auth_info_bytes: auth_info_bytes.clone(),
            chain_id: self.chain_id.clone(),
            account_number: account.account_number,
        };
        let signature = self.key.sign(&sign_doc.encode_to_vec());

        Ok(TxRaw {
            body_bytes,
            auth_info_bytes,
            signatures: vec![signature.to_vec()],
        }
        .encode_to_vec())
    }

    /// Adopt the chain's view of the sequence.
    ///
    /// `reported` is the sequence the node said it expected, if it said so; the
    /// node's mempool view can be ahead of the committed account state.
    async fn resync(&self, account: &mut Account, reported: Option<u64>) -> Result<(), RpcError> {
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        let committed = self.client.account(&account.address).await?;
        let sequence = reported.map_or(committed.sequence, |r| r.max(committed.sequence));

        info!(
            local = account.sequence,
            committed = committed.sequence,
            reported = ?reported,
            adopted = sequence,
            "Resynchronized account sequence"
        );
        account.account_number = committed.account_number;
        account.sequence = sequence;
        Ok(())
    }
}

/// Whether a CheckTx failure is the sdk's wrong-sequence error.
fn is_sequence_mismatch(code: u32, codespace: &str, log: &str) -> bool {
    (code == SEQUENCE_MISMATCH_CODE && (codespace == "sdk" || codespace.is_empty()))
        || log.contains("account sequence mismatch")
}

/// Parse `expected N` out of an sdk sequence-mismatch log.
fn expected_sequence(log: &str) -> Option<u64> {
    let rest = &log[log.find("expected ")? + "expected ".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[async_trait]
impl TxBroadcaster for AccountSigner {
    #[instrument(skip_all, fields(msgs = msgs.len()))]
    async fn sign_and_broadcast(
        &self,
        msgs: Vec<ContractMsg>,
        memo: &str,
    ) -> Result<BroadcastResult, BroadcastError> {
        let mut account = self.account.lock().await;
        let mut resynced = false;

        loop {
            let tx = self.build_tx(&account, &msgs, memo)?;
            let sequence = account.sequence;
            let started = Instant::now();
            self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);

            let response = match self.client.broadcast_tx_sync(tx).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(sequence, error = %e, "Broadcast transport failure, resyncing sequence");
                    if let Err(sync_err) = self.resync(&mut account, None).await {
                        warn!(error = %sync_err, "Sequence resync failed, keeping local value");
                    }
                    return Err(BroadcastError::Transport(e.to_string()));
                }
            };

            if response.code == 0 {
                account.sequence += 1;
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                info!(
                    tx_hash = %response.hash,
                    sequence,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transaction accepted"
                );
                return Ok(BroadcastResult {
                    tx_hash: response.hash,
                    sequence,
                    log: response.log,
                });
            }

            if is_sequence_mismatch(response.code, &response.codespace, &response.log) {
                if resynced {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(sequence, log = %response.log, "Sequence mismatch persists after resync");
                    return Err(BroadcastError::SequenceMismatch {
                        sent: sequence,
                        log: response.log,
                    });
                }

                warn!(sequence, log = %response.log, "Sequence mismatch, resyncing and retrying once");
                self.resync(&mut account, expected_sequence(&response.log))
                    .await
                    .map_err(|e| BroadcastError::Transport(e.to_string()))?;
                resynced = true;
                continue;
            }

            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                sequence,
                code = response.code,
                codespace = %response.codespace,
                log = %response.log,
                "Transaction rejected"
            );
            return Err(BroadcastError::Rejected {
                code: response.code,
                codespace: response.codespace,
                log: response.log,
            });
        }
    }

    #[instrument(skip(self))]
    async fn wait_for_commit(&self, tx_hash: &str) -> Result<TxResult, BroadcastError> {
        let deadline = Instant::now() + self.commit_timeout;

        loop {
            match self.client.get_tx(tx_hash).await {
                Ok(Some(tx)) if tx.code == 0 => {
                    debug!(height = tx.height, "Transaction committed");
                    return Ok(tx);
                }
                Ok(Some(tx)) => {
                    return Err(BroadcastError::ExecutionFailed {
                        hash: tx.hash,
                        height: tx.height,
                        code: tx.code,
                        log: tx.log,
                    })
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Transaction lookup failed"),
            }

            if Instant::now() >= deadline {
                return Err(BroadcastError::NotIncluded(tx_hash.to_string()));
            }
            tokio::time::sleep(self.commit_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ExecuteMsg;
    use crate::rpc::{AccountState, BroadcastResponse};
    use parking_lot::Mutex as SyncMutex;

    /// In-memory chain that validates the sequence of every broadcast.
    struct FakeChain {
        state: SyncMutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        /// Sequence the node expects next (mempool view)
        expected: u64,
        /// Committed sequence returned by account queries
        committed: u64,
        /// Sequences of accepted transactions, in order
        accepted: Vec<u64>,
        /// Sequences of every broadcast attempt
        attempts: Vec<u64>,
        /// Reject everything with this code
        reject_code: Option<u32>,
        /// Fail the next N broadcasts at the transport level
        transport_failures: u32,
        /// Keep reporting mismatch regardless of sequence
        always_mismatch: bool,
        txs: Vec<(String, TxResult)>,
    }

    impl FakeChain {
        fn new(expected: u64, committed: u64) -> Arc<Self> {
            Arc::new(Self {
                state: SyncMutex::new(FakeState {
                    expected,
                    committed,
                    ..Default::default()
                }),
            })
        }
    }

    fn sequence_of(tx: &[u8]) -> u64 {
        let raw = TxRaw::decode(tx).unwrap();
        let auth = AuthInfo::decode(raw.auth_info_bytes.as_slice()).unwrap();
        auth.signer_infos[0].sequence
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn chain_id(&self) -> Result<String, RpcError> {
            Ok("test-1".into())
        }

        async fn account(&self, _address: &str) -> Result<AccountState, RpcError> {
            let state = self.state.lock();
            Ok(AccountState {
                account_number: 3,
                sequence: state.committed,
            })
        }

        async fn broadcast_tx_sync(&self, tx: Vec<u8>) -> Result<BroadcastResponse, RpcError> {
            // Yield so concurrent callers interleave at the await point
            tokio::task::yield_now().await;

            let sequence = sequence_of(&tx);
            let mut state = self.state.lock();
            state.attempts.push(sequence);

            if state.transport_failures > 0 {
                state.transport_failures -= 1;
                return Err(RpcError::Transport("connection reset".into()));
            }
            if let Some(code) = state.reject_code {
                return Ok(BroadcastResponse {
                    code,
                    codespace: "wasm".into(),
                    log: "execute wasm contract failed".into(),
                    hash: String::new(),
                });
            }
            if state.always_mismatch || sequence != state.expected {
                let log = format!(
                    "account sequence mismatch, expected {}, got {}: incorrect account sequence",
                    state.expected, sequence
                );
                return Ok(BroadcastResponse {
                    code: 32,
                    codespace: "sdk".into(),
                    log,
                    hash: String::new(),
                });
            }

            state.expected += 1;
            state.accepted.push(sequence);
            let hash = format!("{:064X}", sequence);
            state.txs.push((
                hash.clone(),
                TxResult {
                    hash: hash.clone(),
                    height: 100 + sequence,
                    code: 0,
                    log: String::new(),
                },
            ));
            Ok(BroadcastResponse {
                code: 0,
                codespace: String::new(),
                log: String::new(),
                hash,
            })
        }

        async fn get_tx(&self, hash: &str) -> Result<Option<TxResult>, RpcError> {
            let state = self.state.lock();
            Ok(state
                .txs
                .iter()
                .find(|(h, _)| h == hash)
                .map(|(_, tx)| tx.clone()))
        }
    }

    fn signer(chain: Arc<FakeChain>, local_sequence: u64) -> AccountSigner {
        let key = SigningKey::from_hex(&"11".repeat(32)).unwrap();
        let account = Account {
            address: key.address("cosmos").unwrap(),
            public_key: key.public_key().to_vec(),
            account_number: 3,
            sequence: local_sequence,
        };
        AccountSigner::from_parts(chain, key, "test-1".into(), FeeConfig::default(), account)
    }

    fn liquidate(user: &str) -> Vec<ContractMsg> {
        vec![ContractMsg::new(
            "cosmos1contract",
            ExecuteMsg::Liquidate { user: user.into() },
        )]
    }

    #[tokio::test]
    async fn test_sequential_broadcasts_advance_by_one() {
        let chain = FakeChain::new(0, 0);
        let signer = signer(chain.clone(), 0);

        for i in 0..5 {
            let result = signer
                .sign_and_broadcast(liquidate("cosmos1a"), "")
                .await
                .unwrap();
            assert_eq!(result.sequence, i);
        }

        assert_eq!(signer.account().await.sequence, 5);
        assert_eq!(chain.state.lock().accepted, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_share_a_sequence() {
        let chain = FakeChain::new(10, 10);
        let signer = Arc::new(signer(chain.clone(), 10));

        let mut handles = Vec::new();
        for i in 0..32 {
            let signer = signer.clone();
            handles.push(tokio::spawn(async move {
                signer
                    .sign_and_broadcast(liquidate(&format!("cosmos1user{i}")), "")
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let state = chain.state.lock();
        let expected: Vec<u64> = (10..42).collect();
        assert_eq!(state.accepted, expected);
        // No mismatch was ever provoked
        assert_eq!(state.attempts, expected);
        drop(state);
        assert_eq!(signer.account().await.sequence, 42);
    }

    #[tokio::test]
    async fn test_sequence_mismatch_resyncs_and_retries_once() {
        // Local state says 7, chain expects 9
        let chain = FakeChain::new(9, 9);
        let signer = signer(chain.clone(), 7);

        let result = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap();

        assert_eq!(result.sequence, 9);
        assert_eq!(signer.account().await.sequence, 10);
        assert_eq!(chain.state.lock().attempts, vec![7, 9]);
        assert_eq!(signer.stats().resyncs.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_reported_sequence_wins_over_stale_committed_state() {
        // Node's mempool is at 9 while committed state still says 8
        let chain = FakeChain::new(9, 8);
        let signer = signer(chain.clone(), 7);

        let result = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap();
        assert_eq!(result.sequence, 9);
        assert_eq!(signer.account().await.sequence, 10);
    }

    #[tokio::test]
    async fn test_persistent_mismatch_surfaces_after_one_retry() {
        let chain = FakeChain::new(4, 4);
        chain.state.lock().always_mismatch = true;
        let signer = signer(chain.clone(), 2);

        let err = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap_err();

        assert!(matches!(err, BroadcastError::SequenceMismatch { sent: 4, .. }));
        assert!(!err.outcome_unknown());
        assert_eq!(chain.state.lock().attempts.len(), 2);
        assert_eq!(signer.account().await.sequence, 4);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let chain = FakeChain::new(0, 0);
        chain.state.lock().reject_code = Some(5);
        let signer = signer(chain.clone(), 0);

        let err = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap_err();

        assert!(matches!(err, BroadcastError::Rejected { code: 5, .. }));
        assert_eq!(chain.state.lock().attempts.len(), 1);
        assert_eq!(signer.account().await.sequence, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_resyncs_without_resubmitting() {
        let chain = FakeChain::new(6, 6);
        chain.state.lock().transport_failures = 1;
        let signer = signer(chain.clone(), 3);

        let err = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::Transport(_)));
        assert!(err.outcome_unknown());
        assert_eq!(chain.state.lock().attempts.len(), 1);
        assert_eq!(signer.account().await.sequence, 6);

        // Next call uses the resynced value directly
        let result = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap();
        assert_eq!(result.sequence, 6);
    }

    #[tokio::test]
    async fn test_wait_for_commit() {
        let chain = FakeChain::new(0, 0);
        let signer = signer(chain.clone(), 0)
            .with_commit_timing(Duration::from_millis(50), Duration::from_millis(5));

        let result = signer
            .sign_and_broadcast(liquidate("cosmos1a"), "")
            .await
            .unwrap();
        let tx = signer.wait_for_commit(&result.tx_hash).await.unwrap();
        assert_eq!(tx.height, 100);

        let missing = signer.wait_for_commit("DEADBEEF").await.unwrap_err();
        assert!(matches!(missing, BroadcastError::NotIncluded(_)));
        assert!(missing.outcome_unknown());
    }

    #[test]
    fn test_expected_sequence_parsing() {
        assert_eq!(
            expected_sequence("account sequence mismatch, expected 9, got 7: incorrect account sequence"),
            Some(9)
        );
        assert_eq!(expected_sequence("out of gas"), None);
        assert!(is_sequence_mismatch(32, "sdk", ""));
        assert!(!is_sequence_mismatch(32, "wasm", "other"));
        assert!(!is_sequence_mismatch(5, "sdk", "insufficient funds"));
    }
}
