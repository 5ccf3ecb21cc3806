//! JSON messages understood by the lending contract.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::keys::SigningKey;
use crate::proto::Coin;

/// Decimal places of the contract's fixed-point prices.
pub const PRICE_DECIMALS: u32 = 6;

/// CosmWasm `Uint128`: serialized as a decimal string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uint128(pub u128);

impl fmt::Display for Uint128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Uint128 {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl Serialize for Uint128 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Uint128 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse::<u128>()
            .map(Self)
            .map_err(|e| serde::de::Error::custom(format!("invalid Uint128 {text:?}: {e}")))
    }
}

/// Execute messages of the lending contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteMsg {
    CreateAccount {},
    Borrow {
        borrow_amount: Uint128,
        collateral_denom: String,
        collateral_amount: Uint128,
    },
    Repay {
        withdraw_denom: String,
        withdraw_amount: Uint128,
    },
    UpdatePrices {
        prices: Vec<SignedPriceUpdate>,
    },
    Liquidate {
        user: String,
    },
}

impl ExecuteMsg {
    /// Short label for logs.
    pub fn action(&self) -> &'static str {
        match self {
            Self::CreateAccount {} => "create_account",
            Self::Borrow { .. } => "borrow",
            Self::Repay { .. } => "repay",
            Self::UpdatePrices { .. } => "update_prices",
            Self::Liquidate { .. } => "liquidate",
        }
    }
}

/// Query messages of the lending contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMsg {
    GetAccount { address: String },
    MaxWithdrawableAmount { token_denom: String },
}

/// One contract call inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractMsg {
    pub contract: String,
    pub msg: ExecuteMsg,
    pub funds: Vec<Coin>,
}

impl ContractMsg {
    pub fn new(contract: impl Into<String>, msg: ExecuteMsg) -> Self {
        Self {
            contract: contract.into(),
            msg,
            funds: Vec::new(),
        }
    }
}

/// The payload the feeder signs. Field order is the canonical byte order.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct PricePayload<'a> {
    coin_id: &'a str,
    price: Uint128,
    timestamp: u64,
}

/// A price update signed by the feeder key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPriceUpdate {
    pub coin_id: String,
    /// USD price scaled by `10^PRICE_DECIMALS`
    pub price: Uint128,
    pub timestamp: u64,
    /// Base64 compact secp256k1 signature over `sha256(payload)`
    pub signature: String,
    /// Base64 compressed public key
    pub feeder_public_key: String,
}

impl SignedPriceUpdate {
    pub fn sign(key: &SigningKey, coin_id: &str, price: Uint128, timestamp: u64) -> Self {
        let payload = signing_payload(coin_id, price, timestamp);
        Self {
            coin_id: coin_id.to_string(),
            price,
            timestamp,
            signature: BASE64.encode(key.sign(&payload)),
            feeder_public_key: key.public_key_base64(),
        }
    }

    /// Bytes covered by `signature`.
    pub fn payload(&self) -> Vec<u8> {
        signing_payload(&self.coin_id, self.price, self.timestamp)
    }
}

fn signing_payload(coin_id: &str, price: Uint128, timestamp: u64) -> Vec<u8> {
    let payload = PricePayload {
        coin_id,
        price,
        timestamp,
    };
    // Serializing a struct of strings and integers cannot fail
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// Convert a USD price to the contract's fixed-point integer, rounding down.
///
/// Returns `None` for non-positive prices and for prices that round to zero.
pub fn to_fixed_price(usd_price: Decimal) -> Option<Uint128> {
    if usd_price <= Decimal::ZERO {
        return None;
    }
    let scaled = usd_price.checked_mul(Decimal::from(10u64.pow(PRICE_DECIMALS)))?;
    let units = scaled.floor().to_u128()?;
    (units > 0).then_some(Uint128(units))
}
