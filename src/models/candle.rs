//! Fixed-interval candle (kline) model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,

    /// Base-asset volume traded during the candle
    pub volume: Decimal,
}

/// Body colour of a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleDirection {
    Green,
    Red,
    Doji,
}

impl Candle {
    pub fn direction(&self) -> CandleDirection {
        if self.close > self.open {
            CandleDirection::Green
        } else if self.close < self.open {
            CandleDirection::Red
        } else {
            CandleDirection::Doji
        }
    }
}
