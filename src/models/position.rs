//! Position model as reported by the exchange for the whole account.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// An account position on one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Instrument symbol (e.g. "BTCUSDC")
    pub symbol: String,

    /// Signed position amount: positive for long, negative for short
    pub amount: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    /// Unrealized P&L in the quote asset
    pub unrealized_pnl: Decimal,

    /// Leverage applied to the position
    pub leverage: Decimal,
}

impl ExchangePosition {
    /// Whether the exchange reports a non-zero amount.
    pub fn is_open(&self) -> bool {
        !self.amount.is_zero()
    }

    pub fn side(&self) -> PositionSide {
        PositionSide::from_amount(self.amount)
    }

    /// Margin committed: `|amount| * entry_price / leverage`.
    ///
    /// A non-positive leverage is treated as 1x.
    pub fn margin_value(&self) -> Decimal {
        let leverage = if self.leverage > Decimal::ZERO {
            self.leverage
        } else {
            Decimal::ONE
        };
        self.amount.abs() * self.entry_price / leverage
    }
}
