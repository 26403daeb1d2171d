//! Order direction, position direction and order fill models.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order (and of the trade bias that produces it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// The side that flattens a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    /// Sign applied to quantities: long positions are positive, shorts negative.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a held position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    /// No position.
    #[default]
    Flat,
    Long,
    Short,
}

impl PositionSide {
    /// Position side from a signed exchange amount.
    pub fn from_amount(amount: Decimal) -> Self {
        if amount > Decimal::ZERO {
            PositionSide::Long
        } else if amount < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    /// Order side that opened this position.
    pub fn entry_side(&self) -> Option<TradeSide> {
        match self {
            PositionSide::Long => Some(TradeSide::Buy),
            PositionSide::Short => Some(TradeSide::Sell),
            PositionSide::Flat => None,
        }
    }
}

impl From<TradeSide> for PositionSide {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => PositionSide::Long,
            TradeSide::Sell => PositionSide::Short,
        }
    }
}

/// Result of a market order reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,

    /// Quantity actually executed (unsigned)
    pub executed_quantity: Decimal,

    /// Average fill price; zero when the exchange did not report one
    pub avg_price: Decimal,
}
