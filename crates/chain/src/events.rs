//! Typed lending events decoded from contract event attributes.
//!
//! Attributes are looked up by key. Their order within an event is not a
//! stable contract and is never relied on.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// One ABCI event as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, attributes: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.into(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// All events of one delivered transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvents {
    pub height: u64,
    /// Position of the transaction within its block
    pub tx_index: u32,
    pub tx_hash: String,
    pub events: Vec<RawEvent>,
}

/// Position of an event in chain history. Ordered by height, then tx, then event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub height: u64,
    pub tx_index: u32,
    pub event_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LendingEventKind {
    CreateAccount,
    Borrow,
    Repay,
    Liquidate,
}

impl LendingEventKind {
    fn from_action(action: &str) -> Option<Self> {
        match action {
            "create_account" => Some(Self::CreateAccount),
            "borrow" => Some(Self::Borrow),
            "repay" => Some(Self::Repay),
            "liquidate" => Some(Self::Liquidate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAccount => "create_account",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
            Self::Liquidate => "liquidate",
        }
    }
}

/// A decoded lending event.
///
/// `collateral_amount` and `debt_amount` are deltas in the direction implied
/// by `kind` (added on borrow, removed on repay and liquidate). The `*_total`
/// fields carry absolute post-event amounts when the contract emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LendingEvent {
    pub id: EventId,
    pub kind: LendingEventKind,
    pub user: String,
    pub collateral_denom: Option<String>,
    pub collateral_amount: Option<Decimal>,
    pub debt_denom: Option<String>,
    pub debt_amount: Option<Decimal>,
    pub collateral_total: Option<Decimal>,
    pub debt_total: Option<Decimal>,
    pub tx_hash: String,
}

impl LendingEvent {
    pub fn height(&self) -> u64 {
        self.id.height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind} event is missing attribute {key:?}")]
    MissingAttribute { kind: &'static str, key: &'static str },
    #[error("{kind} event has invalid {key:?}: {value:?}")]
    InvalidAmount {
        kind: &'static str,
        key: &'static str,
        value: String,
    },
}

struct Fields<'a> {
    kind: LendingEventKind,
    event: &'a RawEvent,
}

impl<'a> Fields<'a> {
    /// First present key among `keys`.
    fn optional(&self, keys: &[&'static str]) -> Option<&'a str> {
        keys.iter().find_map(|k| self.event.get(k))
    }

    fn required(&self, keys: &[&'static str]) -> Result<&'a str, DecodeError> {
        self.optional(keys).ok_or(DecodeError::MissingAttribute {
            kind: self.kind.as_str(),
            key: keys[0],
        })
    }

    fn amount(&self, key: &'static str, value: &str) -> Result<Decimal, DecodeError> {
        Decimal::from_str(value.trim())
            .ok()
            .filter(|d| !d.is_sign_negative())
            .ok_or_else(|| DecodeError::InvalidAmount {
                kind: self.kind.as_str(),
                key,
                value: value.to_string(),
            })
    }

    fn required_amount(&self, key: &'static str) -> Result<Decimal, DecodeError> {
        let value = self.required(&[key])?;
        self.amount(key, value)
    }

    fn optional_amount(&self, key: &'static str) -> Result<Option<Decimal>, DecodeError> {
        self.optional(&[key])
            .map(|value| self.amount(key, value))
            .transpose()
    }
}

/// Contract operation carried by an event, if it is one of ours.
fn action_of<'a>(event: &'a RawEvent) -> Option<&'a str> {
    if event.kind == "wasm" {
        event.get("action").or_else(|| event.get("method"))
    } else {
        event.kind.strip_prefix("wasm-")
    }
}

/// Decode one event.
///
/// Returns `Ok(None)` for events that are not lending events of `contract`
/// and `Err` for lending events that lack required attributes.
pub fn decode_event(
    event: &RawEvent,
    id: EventId,
    tx_hash: &str,
    contract: &str,
) -> Result<Option<LendingEvent>, DecodeError> {
    if event.get("_contract_address").is_some_and(|addr| addr != contract) {
        return Ok(None);
    }
    let Some(kind) = action_of(event).and_then(LendingEventKind::from_action) else {
        return Ok(None);
    };

    let f = Fields { kind, event };
    let mut decoded = LendingEvent {
        id,
        kind,
        user: String::new(),
        collateral_denom: None,
        collateral_amount: None,
        debt_denom: None,
        debt_amount: None,
        collateral_total: f.optional_amount("collateral_total")?,
        debt_total: f.optional_amount("debt_total")?,
        tx_hash: tx_hash.to_string(),
    };

    match kind {
        LendingEventKind::CreateAccount => {
            decoded.user = f.required(&["address", "user"])?.to_string();
        }
        LendingEventKind::Borrow => {
            decoded.user = f.required(&["borrower", "user"])?.to_string();
            decoded.collateral_denom = Some(f.required(&["collateral_denom"])?.to_string());
            decoded.collateral_amount = Some(f.required_amount("collateral_amount")?);
            decoded.debt_amount = Some(f.required_amount("borrowed_amount")?);
            decoded.debt_denom = f.optional(&["debt_denom"]).map(str::to_string);
        }
        LendingEventKind::Repay => {
            decoded.user = f.required(&["repayer", "user"])?.to_string();
            decoded.debt_amount = Some(f.required_amount("usdc_repaid")?);
            decoded.collateral_denom = Some(f.required(&["collateral_withdrawn"])?.to_string());
            decoded.collateral_amount = Some(f.required_amount("withdrawal_amount")?);
            decoded.debt_denom = f.optional(&["debt_denom"]).map(str::to_string);
        }
        LendingEventKind::Liquidate => {
            decoded.user = f.required(&["user", "borrower"])?.to_string();
            decoded.collateral_amount = f.optional_amount("collateral_seized")?;
            decoded.debt_amount = f.optional_amount("debt_repaid")?;
            decoded.collateral_denom = f.optional(&["collateral_denom"]).map(str::to_string);
        }
    }

    Ok(Some(decoded))
}

/// Decode every lending event of `contract` in one transaction.
pub fn decode_tx(tx: &TxEvents, contract: &str) -> Vec<Result<LendingEvent, DecodeError>> {
    tx.events
        .iter()
        .enumerate()
        .filter_map(|(i, event)| {
            let id = EventId {
                height: tx.height,
                tx_index: tx.tx_index,
                event_index: i as u32,
            };
            decode_event(event, id, &tx.tx_hash, contract).transpose()
        })
        .collect()
}
