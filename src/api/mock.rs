//! In-memory exchange used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use crate::models::{Candle, ExchangePosition, OrderFill, TradeSide};

use super::exchange::{ExchangeClient, PriceStream, PriceTick};

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
}

#[derive(Default)]
struct MockState {
    balance: Option<Decimal>,
    prices: HashMap<String, Decimal>,
    max_leverage: HashMap<String, u32>,
    step_sizes: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    instruments: Vec<String>,
    positions: HashMap<String, ExchangePosition>,
    leverage_set: HashMap<String, u32>,
    orders: Vec<PlacedOrder>,
    cancelled: Vec<String>,
    subscriptions: HashSet<String>,
    next_order_id: u64,
    fail_orders: bool,
    fail_set_leverage: bool,
    fail_cancel: bool,
}

/// Simulated account: market orders fill instantly at the current price.
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                balance: Some(dec!(1000)),
                next_order_id: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_balance(&self, balance: Option<Decimal>) {
        self.state().balance = balance;
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn set_max_leverage(&self, symbol: &str, leverage: u32) {
        self.state().max_leverage.insert(symbol.to_string(), leverage);
    }

    pub fn set_step_size(&self, symbol: &str, step: Decimal) {
        self.state().step_sizes.insert(symbol.to_string(), step);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.state().candles.insert(symbol.to_string(), candles);
    }

    /// Register a tradable symbol with a price, a volume signal and default caps.
    pub fn list_symbol(&self, symbol: &str, price: Decimal, signal: Option<TradeSide>) {
        let mut state = self.state();
        state.instruments.push(symbol.to_string());
        state.prices.insert(symbol.to_string(), price);
        state.candles.insert(symbol.to_string(), signal_candles(signal));
    }

    pub fn set_position(&self, symbol: &str, amount: Decimal, entry_price: Decimal) {
        self.state().positions.insert(
            symbol.to_string(),
            ExchangePosition {
                symbol: symbol.to_string(),
                amount,
                entry_price,
                unrealized_pnl: Decimal::ZERO,
                leverage: dec!(10),
            },
        );
    }

    pub fn set_unrealized_pnl(&self, symbol: &str, pnl: Decimal) {
        if let Some(p) = self.state().positions.get_mut(symbol) {
            p.unrealized_pnl = pnl;
        }
    }

    pub fn clear_position(&self, symbol: &str) {
        self.state().positions.remove(symbol);
    }

    pub fn position(&self, symbol: &str) -> Option<ExchangePosition> {
        self.state().positions.get(symbol).cloned()
    }

    pub fn fail_orders(&self, fail: bool) {
        self.state().fail_orders = fail;
    }

    pub fn fail_set_leverage(&self, fail: bool) {
        self.state().fail_set_leverage = fail;
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.state().fail_cancel = fail;
    }

    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.state().orders.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn leverage_set(&self, symbol: &str) -> Option<u32> {
        self.state().leverage_set.get(symbol).copied()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.state().subscriptions.contains(symbol)
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Ten 5m candles whose last closed one carries the requested volume signal.
pub fn signal_candles(signal: Option<TradeSide>) -> Vec<Candle> {
    let mut candles: Vec<Candle> = (0..10)
        .map(|i| Candle {
            open_time: i * 300_000,
            open: dec!(10),
            high: dec!(10),
            low: dec!(10),
            close: dec!(10),
            volume: dec!(100),
        })
        .collect();

    let current = &mut candles[8];
    match signal {
        Some(TradeSide::Buy) => {
            current.close = dec!(11);
            current.volume = dec!(150);
        }
        Some(TradeSide::Sell) => {
            current.close = dec!(9);
            current.volume = dec!(150);
        }
        None => {}
    }

    candles
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn max_leverage(&self, symbol: &str) -> Result<u32> {
        Ok(self.state().max_leverage.get(symbol).copied().unwrap_or(125))
    }

    async fn step_size(&self, symbol: &str) -> Result<Decimal> {
        Ok(self
            .state()
            .step_sizes
            .get(symbol)
            .copied()
            .unwrap_or(dec!(0.001)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.state();
        if state.fail_set_leverage {
            bail!("leverage rejected");
        }
        state.leverage_set.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn balance(&self) -> Result<Decimal> {
        self.state()
            .balance
            .ok_or_else(|| anyhow!("balance unavailable"))
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.state()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", symbol))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderFill> {
        let mut state = self.state();
        if state.fail_orders {
            bail!("order rejected");
        }

        let price = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", symbol))?;
        let leverage = Decimal::from(state.leverage_set.get(symbol).copied().unwrap_or(1));

        state.orders.push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
        });

        let delta = side.sign() * quantity;
        let existing = state.positions.remove(symbol);
        let (amount, entry_price) = match existing {
            Some(p) if p.amount.is_sign_positive() == delta.is_sign_positive() => {
                let total = p.amount.abs() + quantity;
                let entry = (p.amount.abs() * p.entry_price + quantity * price) / total;
                (p.amount + delta, entry)
            }
            Some(p) => (p.amount + delta, p.entry_price),
            None => (delta, price),
        };

        if !amount.is_zero() {
            state.positions.insert(
                symbol.to_string(),
                ExchangePosition {
                    symbol: symbol.to_string(),
                    amount,
                    entry_price,
                    unrealized_pnl: Decimal::ZERO,
                    leverage,
                },
            );
        }

        let order_id = state.next_order_id;
        state.next_order_id += 1;

        Ok(OrderFill {
            order_id: order_id.to_string(),
            executed_quantity: quantity,
            avg_price: price,
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_cancel {
            bail!("cancel rejected");
        }
        state.cancelled.push(symbol.to_string());
        Ok(())
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
        let state = self.state();
        Ok(state
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn tradable_instruments(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self.state().instruments.iter().take(limit).cloned().collect())
    }

    async fn recent_candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let state = self.state();
        let candles = state
            .candles
            .get(symbol)
            .ok_or_else(|| anyhow!("no candles for {}", symbol))?;
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles[skip..].to_vec())
    }
}

#[async_trait]
impl PriceStream for MockExchange {
    async fn subscribe(&self, symbol: &str, sink: mpsc::Sender<PriceTick>) -> Result<()> {
        let mut state = self.state();
        state.subscriptions.insert(symbol.to_string());
        if let Some(price) = state.prices.get(symbol).copied() {
            let _ = sink.try_send(PriceTick {
                symbol: symbol.to_string(),
                price,
                timestamp: 0,
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) {
        self.state().subscriptions.remove(symbol);
    }
}
