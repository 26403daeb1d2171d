//! Exchange collaborator contracts consumed by the trading core.
//!
//! The core only ever talks to `dyn ExchangeClient` and `dyn PriceStream`, so
//! the Binance implementation and the in-memory test double are
//! interchangeable.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::models::{Candle, ExchangePosition, OrderFill, TradeSide};

/// Latest price observed on the streaming feed.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    /// Event time in epoch milliseconds
    pub timestamp: i64,
}

/// Account and market operations on a futures exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Maximum leverage the exchange allows for the symbol.
    async fn max_leverage(&self, symbol: &str) -> Result<u32>;

    /// Minimum quantity increment for orders on the symbol.
    async fn step_size(&self, symbol: &str) -> Result<Decimal>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Available balance of the quote asset.
    async fn balance(&self) -> Result<Decimal>;

    async fn current_price(&self, symbol: &str) -> Result<Decimal>;

    /// Submit a market order.
    async fn place_order(&self, symbol: &str, side: TradeSide, quantity: Decimal)
        -> Result<OrderFill>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Positions for one symbol, or for the whole account when `symbol` is `None`.
    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>>;

    /// Tradable instrument universe, at most `limit` symbols.
    async fn tradable_instruments(&self, limit: usize) -> Result<Vec<String>>;

    /// Most recent candles, oldest first.
    async fn recent_candles(&self, symbol: &str, interval: &str, limit: u32)
        -> Result<Vec<Candle>>;
}

/// Streaming price subscriptions, keyed by symbol.
#[async_trait]
pub trait PriceStream: Send + Sync {
    /// Start pushing ticks for `symbol` into `sink`, replacing any previous
    /// subscription for the same symbol.
    async fn subscribe(&self, symbol: &str, sink: mpsc::Sender<PriceTick>) -> Result<()>;

    async fn unsubscribe(&self, symbol: &str);
}
