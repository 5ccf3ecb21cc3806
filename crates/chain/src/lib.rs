//! Keeper chain interaction layer.
//!
//! This crate provides:
//! - secp256k1 key derivation and bech32 addresses for the keeper account
//! - Cosmos SDK transaction encoding (protobuf) and signing
//! - CometBFT RPC client (tendermint-rpc) for queries, broadcasts and tx search
//! - The account signer that serializes every use of the account sequence
//! - WebSocket subscription to contract events and typed event decoding
//! - Contract execute/query messages, including signed price updates

mod event_listener;
pub mod events;
mod keys;
pub mod messages;
pub mod proto;
mod rpc;
mod signer;

pub use event_listener::{EventListener, TxEventSource};
pub use events::{
    decode_event, decode_tx, DecodeError, EventId, LendingEvent, LendingEventKind, RawEvent,
    TxEvents,
};
pub use keys::{SigningKey, COSMOS_COIN_TYPE};
pub use messages::{
    to_fixed_price, ContractMsg, ExecuteMsg, QueryMsg, SignedPriceUpdate, Uint128, PRICE_DECIMALS,
};
pub use rpc::{
    AccountState, BroadcastResponse, ChainClient, ContractQuerier, RpcClient, RpcError, TxResult,
};
pub use signer::{
    Account, AccountSigner, BroadcastError, BroadcastResult, FeeConfig, SignerStats,
    TxBroadcaster,
};
