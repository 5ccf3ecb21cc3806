//! Lending position mirrored from contract events.

use keeper_chain::{EventId, LendingEvent, LendingEventKind};
use rust_decimal::Decimal;
use thiserror::Error;

/// An event whose delta does not fit in a `Decimal` on top of the current amount.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} of {user} overflows at height {height}")]
pub struct AmountOverflow {
    pub user: String,
    pub field: &'static str,
    pub height: u64,
}

/// One user's position as last seen on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Borrower address
    pub user: String,
    /// Collateral denom (empty until the first borrow)
    pub collateral_denom: String,
    /// Collateral in base units of `collateral_denom`
    pub collateral_amount: Decimal,
    pub debt_denom: String,
    /// Debt in base units of `debt_denom`
    pub debt_amount: Decimal,
    /// Height of the last applied event
    pub last_updated_height: u64,
    /// Last applied event; older or equal events are ignored
    pub last_event: Option<EventId>,
}

/// Price of one denom together with its on-chain precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenomPrice {
    pub usd_price: Decimal,
    pub decimals: u32,
}

impl DenomPrice {
    /// USD value of `amount` base units, `None` on overflow.
    pub fn value_of(&self, amount: Decimal) -> Option<Decimal> {
        amount
            .checked_mul(self.usd_price)?
            .checked_mul(Decimal::new(1, self.decimals))
    }
}

impl Position {
    pub fn new(user: impl Into<String>, debt_denom: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            collateral_denom: String::new(),
            collateral_amount: Decimal::ZERO,
            debt_denom: debt_denom.into(),
            debt_amount: Decimal::ZERO,
            last_updated_height: 0,
            last_event: None,
        }
    }

    pub fn has_debt(&self) -> bool {
        self.debt_amount > Decimal::ZERO
    }

    /// Whether `id` was already applied to this position.
    pub fn has_applied(&self, id: EventId) -> bool {
        self.last_event.is_some_and(|last| id <= last)
    }

    /// Apply a decoded event. Returns `false` (and changes nothing) for replays.
    ///
    /// An overflowing delta leaves the position untouched.
    pub fn apply(&mut self, event: &LendingEvent) -> Result<bool, AmountOverflow> {
        if self.has_applied(event.id) {
            return Ok(false);
        }

        match event.kind {
            LendingEventKind::CreateAccount => {}
            LendingEventKind::Borrow => {
                let collateral =
                    self.add(self.collateral_amount, event.collateral_amount, "collateral", event)?;
                let debt = self.add(self.debt_amount, event.debt_amount, "debt", event)?;
                if let Some(denom) = &event.collateral_denom {
                    self.collateral_denom = denom.clone();
                }
                if let Some(denom) = &event.debt_denom {
                    self.debt_denom = denom.clone();
                }
                self.collateral_amount = collateral;
                self.debt_amount = debt;
            }
            LendingEventKind::Repay => {
                if let Some(amount) = event.debt_amount {
                    self.debt_amount = sub_floor(self.debt_amount, amount);
                }
                let same_denom = event
                    .collateral_denom
                    .as_deref()
                    .map_or(true, |d| self.collateral_denom.is_empty() || d == self.collateral_denom);
                if let (Some(amount), true) = (event.collateral_amount, same_denom) {
                    self.collateral_amount = sub_floor(self.collateral_amount, amount);
                }
            }
            LendingEventKind::Liquidate => {
                let has_detail = event.collateral_amount.is_some()
                    || event.debt_amount.is_some()
                    || event.collateral_total.is_some()
                    || event.debt_total.is_some();
                if has_detail {
                    if let Some(amount) = event.collateral_amount {
                        self.collateral_amount = sub_floor(self.collateral_amount, amount);
                    }
                    if let Some(amount) = event.debt_amount {
                        self.debt_amount = sub_floor(self.debt_amount, amount);
                    }
                } else {
                    // The contract closes the whole position on liquidation
                    self.collateral_amount = Decimal::ZERO;
                    self.debt_amount = Decimal::ZERO;
                }
            }
        }

        // Absolute amounts win over deltas
        if let Some(total) = event.collateral_total {
            self.collateral_amount = total;
        }
        if let Some(total) = event.debt_total {
            self.debt_amount = total;
        }

        self.last_updated_height = self.last_updated_height.max(event.id.height);
        self.last_event = Some(event.id);
        Ok(true)
    }

    fn add(
        &self,
        current: Decimal,
        delta: Option<Decimal>,
        field: &'static str,
        event: &LendingEvent,
    ) -> Result<Decimal, AmountOverflow> {
        let Some(delta) = delta else {
            return Ok(current);
        };
        current.checked_add(delta).ok_or_else(|| AmountOverflow {
            user: self.user.clone(),
            field,
            height: event.id.height,
        })
    }

    /// `collateral value / debt value`, or `None` without debt or on overflow.
    pub fn health_factor(&self, collateral: DenomPrice, debt: DenomPrice) -> Option<Decimal> {
        if !self.has_debt() {
            return None;
        }
        let collateral_value = collateral.value_of(self.collateral_amount)?;
        let debt_value = debt.value_of(self.debt_amount)?;
        collateral_value.checked_div(debt_value)
    }
}

fn sub_floor(a: Decimal, b: Decimal) -> Decimal {
    (a - b).max(Decimal::ZERO)
}
