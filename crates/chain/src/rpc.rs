//! CometBFT RPC client over HTTP.
//!
//! Wraps `tendermint_rpc::HttpClient` with the calls the keeper needs:
//! `status`, `abci_query`, `broadcast_tx_sync`, `tx` and `tx_search`.
//! Read-only calls are retried on transient failures; broadcasts never are.

use async_trait::async_trait;
use keeper_api::{retry, RetryPolicy, Transient};
use prost::Message;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tendermint::Hash;
use tendermint_rpc::endpoint::tx;
use tendermint_rpc::error::ErrorDetail;
use tendermint_rpc::query::Query;
use tendermint_rpc::{Client, HttpClient, Order};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::events::{RawEvent, TxEvents};
use crate::messages::QueryMsg;
use crate::proto::{
    BaseAccount, QueryAccountRequest, QueryAccountResponse, QuerySmartContractStateRequest,
    QuerySmartContractStateResponse, BASE_ACCOUNT_TYPE_URL, QUERY_ACCOUNT_PATH,
    QUERY_SMART_CONTRACT_PATH,
};

const SEARCH_PAGE_SIZE: u8 = 100;

/// Chain RPC failure.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("rpc request timed out")]
    Timeout,
    #[error("rpc transport error: {0}")]
    Transport(String),
    /// The node answered with a JSON-RPC error.
    #[error("rpc node error: {0}")]
    Node(String),
    #[error("abci query {path} failed with code {code}: {log}")]
    Query { path: String, code: u32, log: String },
    #[error("account {0} not found on chain")]
    AccountNotFound(String),
    #[error("malformed rpc response: {0}")]
    Decode(String),
}

impl Transient for RpcError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

impl From<tendermint_rpc::Error> for RpcError {
    fn from(e: tendermint_rpc::Error) -> Self {
        match e.detail() {
            ErrorDetail::Response(_) => Self::Node(e.to_string()),
            _ => Self::Transport(e.to_string()),
        }
    }
}

/// Account number and sequence as committed on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    pub account_number: u64,
    pub sequence: u64,
}

/// CheckTx result of `broadcast_tx_sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResponse {
    pub code: u32,
    pub codespace: String,
    pub log: String,
    pub hash: String,
}

/// DeliverTx result of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub hash: String,
    pub height: u64,
    pub code: u32,
    pub log: String,
}

/// The chain operations the signer depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<String, RpcError>;

    async fn account(&self, address: &str) -> Result<AccountState, RpcError>;

    async fn broadcast_tx_sync(&self, tx: Vec<u8>) -> Result<BroadcastResponse, RpcError>;

    /// `Ok(None)` while the transaction is not yet included.
    async fn get_tx(&self, hash: &str) -> Result<Option<TxResult>, RpcError>;
}

/// Read-only smart queries against a CosmWasm contract.
#[async_trait]
pub trait ContractQuerier: Send + Sync {
    /// Run `query` and return the contract's JSON answer.
    async fn query_contract(&self, contract: &str, query: &QueryMsg) -> Result<Value, RpcError>;
}

/// HTTP client for one CometBFT node.
pub struct RpcClient {
    inner: HttpClient,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RpcClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RpcError> {
        let inner = HttpClient::new(endpoint)?;
        Ok(Self {
            inner,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    /// Bound one RPC call by the configured timeout.
    async fn timed<T, F>(&self, call: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, tendermint_rpc::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(RpcError::from),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Raw ABCI query; returns the response value bytes.
    pub async fn abci_query(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let res = retry(self.retry, "abci_query", || {
            self.timed(
                self.inner
                    .abci_query(Some(path.to_string()), data.to_vec(), None, false),
            )
        })
        .await?;

        if res.code.is_err() {
            return Err(RpcError::Query {
                path: path.to_string(),
                code: res.code.value(),
                log: res.log,
            });
        }

        Ok(res.value)
    }

    /// Every successful transaction touching `contract` from `from_height` on,
    /// oldest first.
    #[instrument(skip(self))]
    pub async fn search_contract_txs(
        &self,
        contract: &str,
        from_height: u64,
    ) -> Result<Vec<TxEvents>, RpcError> {
        let query = Query::eq("wasm._contract_address", contract).and_gte("tx.height", from_height);
        let mut found = Vec::new();
        let mut page = 1u32;

        loop {
            let response = retry(self.retry, "tx_search", || {
                self.timed(self.inner.tx_search(
                    query.clone(),
                    false,
                    page,
                    SEARCH_PAGE_SIZE,
                    Order::Ascending,
                ))
            })
            .await?;

            let fetched = response.txs.len();
            found.extend(
                response
                    .txs
                    .into_iter()
                    .filter(|tx| tx.tx_result.code.is_ok())
                    .map(tx_events),
            );

            let seen = (page as usize - 1) * SEARCH_PAGE_SIZE as usize + fetched;
            if fetched == 0 || seen >= response.total_count as usize {
                break;
            }
            page += 1;
        }

        debug!(txs = found.len(), "Searched contract transactions");
        Ok(found)
    }
}

/// Convert an ABCI event into the decoder's attribute list.
pub(crate) fn raw_event(event: &tendermint::abci::Event) -> RawEvent {
    RawEvent {
        kind: event.kind.clone(),
        attributes: event
            .attributes
            .iter()
            .map(|a| {
                (
                    String::from_utf8_lossy(a.key_bytes()).into_owned(),
                    String::from_utf8_lossy(a.value_bytes()).into_owned(),
                )
            })
            .collect(),
    }
}

fn tx_events(tx: tx::Response) -> TxEvents {
    TxEvents {
        height: tx.height.value(),
        tx_index: tx.index,
        tx_hash: tx.hash.to_string(),
        events: tx.tx_result.events.iter().map(raw_event).collect(),
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<String, RpcError> {
        let status = retry(self.retry, "status", || self.timed(self.inner.status())).await?;
        Ok(status.node_info.network.to_string())
    }

    #[instrument(skip(self))]
    async fn account(&self, address: &str) -> Result<AccountState, RpcError> {
        let request = QueryAccountRequest {
            address: address.to_string(),
        };
        let bytes = match self
            .abci_query(QUERY_ACCOUNT_PATH, &request.encode_to_vec())
            .await
        {
            Ok(bytes) => bytes,
            Err(RpcError::Query { log, .. }) if log.contains("not found") => {
                return Err(RpcError::AccountNotFound(address.to_string()))
            }
            Err(e) => return Err(e),
        };

        let response = QueryAccountResponse::decode(bytes.as_slice())
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        let any = response
            .account
            .ok_or_else(|| RpcError::AccountNotFound(address.to_string()))?;
        if any.type_url != BASE_ACCOUNT_TYPE_URL {
            return Err(RpcError::Decode(format!(
                "unsupported account type {}",
                any.type_url
            )));
        }

        let account =
            BaseAccount::decode(any.value.as_slice()).map_err(|e| RpcError::Decode(e.to_string()))?;
        debug!(
            account_number = account.account_number,
            sequence = account.sequence,
            "Fetched account"
        );
        Ok(AccountState {
            account_number: account.account_number,
            sequence: account.sequence,
        })
    }

    async fn broadcast_tx_sync(&self, tx: Vec<u8>) -> Result<BroadcastResponse, RpcError> {
        let response = self.timed(self.inner.broadcast_tx_sync(tx)).await?;
        Ok(BroadcastResponse {
            code: response.code.value(),
            codespace: response.codespace,
            log: response.log,
            hash: response.hash.to_string(),
        })
    }

    async fn get_tx(&self, hash: &str) -> Result<Option<TxResult>, RpcError> {
        let hash = parse_tx_hash(hash)?;

        match retry(self.retry, "tx", || self.timed(self.inner.tx(hash, false))).await {
            Ok(tx) => Ok(Some(TxResult {
                hash: tx.hash.to_string(),
                height: tx.height.value(),
                code: tx.tx_result.code.value(),
                log: tx.tx_result.log,
            })),
            Err(RpcError::Node(message)) if message.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ContractQuerier for RpcClient {
    #[instrument(skip(self))]
    async fn query_contract(&self, contract: &str, query: &QueryMsg) -> Result<Value, RpcError> {
        let request = QuerySmartContractStateRequest {
            address: contract.to_string(),
            query_data: serde_json::to_vec(query).map_err(|e| RpcError::Decode(e.to_string()))?,
        };
        let bytes = self
            .abci_query(QUERY_SMART_CONTRACT_PATH, &request.encode_to_vec())
            .await?;
        let response = QuerySmartContractStateResponse::decode(bytes.as_slice())
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        serde_json::from_slice(&response.data).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

fn parse_tx_hash(hash: &str) -> Result<Hash, RpcError> {
    Hash::from_hex_upper(tendermint::hash::Algorithm::Sha256, &hash.to_ascii_uppercase())
        .map_err(|e| RpcError::Decode(format!("tx hash {hash}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_hash_accepts_either_case() {
        let upper = "A".repeat(64);
        let lower = "a".repeat(64);
        assert_eq!(parse_tx_hash(&upper).unwrap(), parse_tx_hash(&lower).unwrap());
        assert_eq!(parse_tx_hash(&lower).unwrap().to_string(), upper);
        assert!(matches!(parse_tx_hash("DEADBEEF"), Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_abci_event_keeps_attributes_by_name() {
        let event = tendermint::abci::Event::new(
            "wasm",
            [
                ("_contract_address", "cosmos1lending"),
                ("action", "borrow"),
                ("borrower", "cosmos1alice"),
            ],
        );
        let raw = raw_event(&event);
        assert_eq!(raw.kind, "wasm");
        assert_eq!(raw.get("action"), Some("borrow"));
        assert_eq!(raw.get("borrower"), Some("cosmos1alice"));
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        assert!(RpcClient::new("not a url", Duration::from_secs(1)).is_err());
        assert!(RpcClient::new("http://127.0.0.1:26657", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_error_transience() {
        assert!(RpcError::Timeout.is_transient());
        assert!(RpcError::Transport("connection refused".into()).is_transient());
        assert!(!RpcError::AccountNotFound("x".into()).is_transient());
        assert!(!RpcError::Node("tx not found".into()).is_transient());
        assert!(!RpcError::Query {
            path: QUERY_ACCOUNT_PATH.into(),
            code: 22,
            log: "key not found".into()
        }
        .is_transient());
    }
}
