//! Volume-confirmed candle direction signal.
//!
//! The last fetched candle is still forming and is ignored. The one before it
//! is "current", the one before that "previous". A signal fires when the
//! current candle has a coloured body and its volume beats both the previous
//! candle by 20% and the window average by 10%.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::api::ExchangeClient;
use crate::models::{Candle, CandleDirection, TradeSide};

use super::TradingConfig;

/// Current volume must exceed the previous candle's by this factor.
const VOLUME_INCREASE_FACTOR: Decimal = dec!(1.2);
/// Current volume must exceed the window average by this factor.
const VOLUME_ABOVE_AVERAGE_FACTOR: Decimal = dec!(1.1);

/// Computes trade signals and leverage caps from exchange market data.
pub struct MarketSignalProvider {
    client: Arc<dyn ExchangeClient>,
    candle_interval: String,
    candle_limit: u32,
}

impl MarketSignalProvider {
    pub fn new(client: Arc<dyn ExchangeClient>, config: &TradingConfig) -> Self {
        Self {
            client,
            candle_interval: config.candle_interval.clone(),
            candle_limit: config.candle_limit,
        }
    }

    /// Direction suggested by the latest closed candle, or `None`.
    /// Fetch failures and short windows yield `None`.
    pub async fn volume_signal(&self, symbol: &str) -> Option<TradeSide> {
        let candles = match self
            .client
            .recent_candles(symbol, &self.candle_interval, self.candle_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Candle fetch failed, no signal");
                return None;
            }
        };

        let signal = evaluate_candles(&candles, self.candle_limit as usize);
        debug!(symbol = %symbol, signal = ?signal, "Volume signal");
        signal
    }

    /// Maximum leverage the exchange allows on `symbol`.
    pub async fn symbol_leverage(&self, symbol: &str) -> Result<u32> {
        self.client.max_leverage(symbol).await
    }
}

/// Evaluate a window of candles, oldest first. Needs at least `min_candles`
/// (and never fewer than three).
pub fn evaluate_candles(candles: &[Candle], min_candles: usize) -> Option<TradeSide> {
    if candles.len() < min_candles.max(3) {
        return None;
    }

    let n = candles.len();
    let current = &candles[n - 2];
    let previous = &candles[n - 3];

    // Average over every closed candle in the window, current included.
    let closed = &candles[..n - 1];
    let average = closed.iter().map(|c| c.volume).sum::<Decimal>() / Decimal::from(closed.len());

    let volume_increase = current.volume > previous.volume * VOLUME_INCREASE_FACTOR;
    let volume_above_average = current.volume > average * VOLUME_ABOVE_AVERAGE_FACTOR;

    if !(volume_increase && volume_above_average) {
        return None;
    }

    match current.direction() {
        CandleDirection::Green => Some(TradeSide::Buy),
        CandleDirection::Red => Some(TradeSide::Sell),
        CandleDirection::Doji => None,
    }
}
