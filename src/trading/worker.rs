//! Per-bot control loop: symbol acquisition, entry, risk management and
//! reconciliation against the exchange.
//!
//! A worker is the single writer of its own state. Readers observe it only
//! through the [`WorkerSnapshot`] published on a watch channel after every
//! tick, so a snapshot is never torn.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ExchangeClient, PriceStream, PriceTick};
use crate::models::{BotStatus, PositionSide, SentimentSnapshot, TradeSide, WorkerSnapshot};

use super::position_sizer::{blended_entry, meets_minimum, size_quantity};
use super::strategy::{evaluate_exit, roi_percent, should_average_down, ExitDecision};
use super::{
    CoinSelector, GlobalSentimentAggregator, SymbolLockTable, SymbolRegistry, TradingConfig,
    WorkerConfig, WorkerTimings,
};

const PRICE_FEED_CAPACITY: usize = 16;

/// Shared collaborators injected into every worker by the orchestrator.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Arc<dyn ExchangeClient>,
    pub prices: Arc<dyn PriceStream>,
    pub registry: Arc<SymbolRegistry>,
    pub locks: Arc<SymbolLockTable>,
    pub selector: Arc<CoinSelector>,
    pub trading: TradingConfig,
    pub timings: WorkerTimings,
}

/// Result of one entry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Opened,
    /// Try again on a later tick, keeping the symbol
    Skipped(String),
    /// The symbol is not tradeable at current settings; release it
    Abandon(String),
}

/// Read side of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: String,
    stop: Arc<AtomicBool>,
    snapshot: watch::Receiver<WorkerSnapshot>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask the worker to stop at the top of its next tick.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// `true` when `period` has elapsed since `last`, or nothing happened yet.
fn due(last: Option<Instant>, now: Instant, period: Duration) -> bool {
    last.map_or(true, |t| now.saturating_duration_since(t) >= period)
}

/// One strategy instance.
pub struct BotWorker {
    id: String,
    config: WorkerConfig,
    ctx: WorkerContext,
    sentiment_source: GlobalSentimentAggregator,
    rng: StdRng,

    symbol: Option<String>,
    status: BotStatus,
    side: PositionSide,
    /// Signed: positive long, negative short
    quantity: Decimal,
    entry_price: Decimal,
    /// Reference price for averaging-down ROI
    entry_base_price: Decimal,
    last_price: Option<Decimal>,
    price_feed: Option<mpsc::Receiver<PriceTick>>,

    average_down_count: u32,
    last_average_down: Option<Instant>,
    high_water_mark_roi: Decimal,
    roi_check_activated: bool,

    last_trade_attempt: Option<Instant>,
    last_close: Option<Instant>,
    last_leverage_check: Option<Instant>,
    last_position_check: Option<Instant>,
    last_sentiment_check: Option<Instant>,
    search_retry_at: Option<Instant>,

    close_attempted: bool,
    last_close_attempt: Option<Instant>,

    sentiment: SentimentSnapshot,
    stop: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<WorkerSnapshot>,
}

impl BotWorker {
    /// Create a worker. A pre-assigned `symbol` is claimed in [`initialize`](Self::initialize).
    pub fn new(
        id: String,
        symbol: Option<String>,
        config: WorkerConfig,
        ctx: WorkerContext,
    ) -> Self {
        let sentiment_source = GlobalSentimentAggregator::new(ctx.client.clone());
        let symbol = symbol.map(|s| s.to_uppercase());

        let initial = WorkerSnapshot {
            id: id.clone(),
            symbol: symbol.clone(),
            status: BotStatus::Searching,
            side: PositionSide::Flat,
            leverage: config.leverage,
            percent: config.percent,
            take_profit: config.take_profit,
            stop_loss: config.stop_loss,
            roi_trigger: config.roi_trigger,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            current_price: None,
            position_open: false,
            average_down_count: 0,
            high_water_mark_roi: Decimal::ZERO,
            roi_check_activated: false,
            sentiment: SentimentSnapshot::default(),
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            id,
            config,
            ctx,
            sentiment_source,
            rng: StdRng::from_entropy(),
            symbol,
            status: BotStatus::Searching,
            side: PositionSide::Flat,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            entry_base_price: Decimal::ZERO,
            last_price: None,
            price_feed: None,
            average_down_count: 0,
            last_average_down: None,
            high_water_mark_roi: Decimal::ZERO,
            roi_check_activated: false,
            last_trade_attempt: None,
            last_close: None,
            last_leverage_check: None,
            last_position_check: None,
            last_sentiment_check: None,
            search_retry_at: None,
            close_attempted: false,
            last_close_attempt: None,
            sentiment: SentimentSnapshot::default(),
            stop: Arc::new(AtomicBool::new(false)),
            snapshot_tx,
        }
    }

    /// Seed the direction tie-break for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id.clone(),
            stop: self.stop.clone(),
            snapshot: self.snapshot_tx.subscribe(),
        }
    }

    fn position_open(&self) -> bool {
        self.status == BotStatus::Open
    }

    // ==================== Lifecycle ====================

    /// Resolve the pre-assigned symbol, if any. A symbol that already carries
    /// an account position or is held by another worker is dropped and the
    /// worker starts searching instead.
    pub async fn initialize(&mut self) {
        if let Some(symbol) = self.symbol.take() {
            let occupied = match self.ctx.client.positions(Some(&symbol)).await {
                Ok(positions) => positions.iter().any(|p| p.is_open()),
                Err(e) => {
                    warn!(bot = %self.id, symbol = %symbol, error = %e, "Position check failed at start-up");
                    false
                }
            };

            if occupied {
                info!(bot = %self.id, symbol = %symbol, "Symbol already has a position, searching instead");
            } else if !self.ctx.registry.claim(&symbol, &self.id) {
                info!(bot = %self.id, symbol = %symbol, "Symbol held by another bot, searching instead");
            } else {
                self.symbol = Some(symbol);
                self.status = BotStatus::Waiting;
                self.subscribe_prices().await;
                self.reconcile_position().await;
            }
        }

        info!(
            bot = %self.id,
            symbol = ?self.symbol,
            status = self.status.as_str(),
            leverage = self.config.leverage,
            "Bot started"
        );
        self.publish();
    }

    /// Tick until stopped, then release everything the worker holds.
    pub async fn run(mut self) {
        self.initialize().await;

        let mut ticker = interval(self.ctx.timings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.tick(Instant::now()).await;
        }

        self.shutdown().await;
    }

    /// Release the symbol and cancel its outstanding orders. The registry
    /// entry is removed even when cancellation fails.
    pub async fn shutdown(&mut self) {
        if let Some(symbol) = self.symbol.take() {
            self.ctx.prices.unsubscribe(&symbol).await;
            self.ctx.registry.release(&symbol, &self.id);
            self.price_feed = None;

            if let Err(e) = self.ctx.client.cancel_all_orders(&symbol).await {
                warn!(bot = %self.id, symbol = %symbol, error = %e, "Failed to cancel orders on stop");
            }
        }

        self.status = if self.position_open() {
            BotStatus::Open
        } else {
            BotStatus::Searching
        };
        info!(bot = %self.id, "Bot stopped");
        self.publish();
    }

    // ==================== Control loop ====================

    /// One pass of the control loop. Steps run strictly in order; every
    /// exchange failure degrades to "retry later" or "abandon this symbol".
    pub async fn tick(&mut self, now: Instant) {
        self.drain_price_feed();

        // 1. Leverage verification
        if due(self.last_leverage_check, now, self.ctx.timings.leverage_check) {
            if self.symbol.is_some() && !self.verify_leverage().await {
                warn!(
                    bot = %self.id,
                    symbol = ?self.symbol,
                    position_open = self.position_open(),
                    "Leverage check failed, releasing symbol"
                );
                self.release_symbol().await;
                self.publish();
                return;
            }
            self.last_leverage_check = Some(now);
        }

        // 2. Global sentiment
        if due(self.last_sentiment_check, now, self.ctx.timings.sentiment_refresh) {
            self.refresh_sentiment().await;
            self.last_sentiment_check = Some(now);
        }

        // 3. Position reconciliation
        if due(self.last_position_check, now, self.ctx.timings.position_check) {
            self.reconcile_position().await;
            self.last_position_check = Some(now);
        }

        // 4. Averaging down
        if self.position_open() {
            self.check_averaging_down(now).await;
        }

        if !self.position_open() {
            // 5. Symbol acquisition
            if self.symbol.is_none() {
                if self.search_retry_at.map_or(true, |t| now >= t)
                    && !self.find_and_set_coin().await
                {
                    self.search_retry_at = Some(now + self.ctx.timings.search_backoff);
                }
                self.publish();
                return;
            }

            // 6. Entry
            if due(self.last_trade_attempt, now, self.ctx.timings.trade_retry)
                && due(self.last_close, now, self.ctx.timings.close_cooldown)
            {
                self.attempt_entry(now).await;
            }
        }

        // 7. Take profit / stop loss
        if self.position_open()
            && (!self.close_attempted
                || due(self.last_close_attempt, now, self.ctx.timings.close_retry))
        {
            self.check_tp_sl(now).await;
        }

        self.publish();
    }

    fn drain_price_feed(&mut self) {
        if let Some(feed) = self.price_feed.as_mut() {
            while let Ok(tick) = feed.try_recv() {
                self.last_price = Some(tick.price);
            }
        }
    }

    async fn verify_leverage(&mut self) -> bool {
        let Some(symbol) = self.symbol.clone() else {
            return true;
        };

        let max = match self.ctx.selector.signals().symbol_leverage(&symbol).await {
            Ok(max) => max,
            Err(e) => {
                warn!(bot = %self.id, symbol = %symbol, error = %e, "Leverage query failed");
                return false;
            }
        };

        let target = if max >= self.config.leverage {
            self.config.leverage
        } else {
            warn!(
                bot = %self.id,
                symbol = %symbol,
                configured = self.config.leverage,
                cap = max,
                "Exchange leverage cap below configuration, lowering"
            );
            max
        };

        match self.ctx.client.set_leverage(&symbol, target).await {
            Ok(()) => true,
            Err(e) => {
                warn!(bot = %self.id, symbol = %symbol, error = %e, "Failed to set leverage");
                false
            }
        }
    }

    async fn refresh_sentiment(&mut self) {
        match self.sentiment_source.compute().await {
            Ok(snapshot) => self.sentiment = snapshot,
            Err(e) => debug!(bot = %self.id, error = %e, "Sentiment refresh failed"),
        }
    }

    /// Refresh sentiment, then pick the direction it favours.
    async fn next_direction(&mut self) -> TradeSide {
        self.refresh_sentiment().await;
        GlobalSentimentAggregator::choose_direction(&self.sentiment, &mut self.rng)
    }

    // ==================== Symbol management ====================

    async fn find_and_set_coin(&mut self) -> bool {
        let target = self.next_direction().await;
        let excluded: HashSet<String> = self.ctx.registry.symbols().into_iter().collect();

        let Some(symbol) = self
            .ctx
            .selector
            .find_best_coin(target, &excluded, self.config.leverage)
            .await
        else {
            debug!(bot = %self.id, direction = %target, "No eligible coin");
            return false;
        };

        if !self.ctx.registry.claim(&symbol, &self.id) {
            debug!(bot = %self.id, symbol = %symbol, "Lost race for symbol");
            return false;
        }

        info!(bot = %self.id, symbol = %symbol, direction = %target, "Symbol acquired");
        self.symbol = Some(symbol);
        self.status = BotStatus::Waiting;
        self.search_retry_at = None;
        self.subscribe_prices().await;
        true
    }

    async fn subscribe_prices(&mut self) {
        let Some(symbol) = self.symbol.clone() else {
            return;
        };

        let (tx, rx) = mpsc::channel(PRICE_FEED_CAPACITY);
        match self.ctx.prices.subscribe(&symbol, tx).await {
            Ok(()) => self.price_feed = Some(rx),
            Err(e) => warn!(bot = %self.id, symbol = %symbol, error = %e, "Price subscription failed"),
        }
    }

    /// Give the symbol back and return to Searching with clean bookkeeping.
    async fn release_symbol(&mut self) {
        if let Some(symbol) = self.symbol.take() {
            self.ctx.prices.unsubscribe(&symbol).await;
            self.ctx.registry.release(&symbol, &self.id);
            info!(bot = %self.id, symbol = %symbol, "Symbol released");
        }

        self.price_feed = None;
        self.last_price = None;
        self.clear_position_state();
        self.status = BotStatus::Searching;
    }

    fn clear_position_state(&mut self) {
        self.side = PositionSide::Flat;
        self.quantity = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;
        self.entry_base_price = Decimal::ZERO;
        self.average_down_count = 0;
        self.high_water_mark_roi = Decimal::ZERO;
        self.roi_check_activated = false;
        self.close_attempted = false;
        self.last_close_attempt = None;
    }

    /// Flat again while keeping the symbol.
    fn reset_position(&mut self) {
        self.clear_position_state();
        self.status = if self.symbol.is_some() {
            BotStatus::Waiting
        } else {
            BotStatus::Searching
        };
    }

    // ==================== Reconciliation ====================

    async fn reconcile_position(&mut self) {
        if let Err(e) = self.sync_position().await {
            debug!(bot = %self.id, error = %e, "Position reconciliation failed");
        }
    }

    /// Adopt the exchange's view of the held symbol's position.
    async fn sync_position(&mut self) -> Result<()> {
        let Some(symbol) = self.symbol.clone() else {
            return Ok(());
        };

        let positions = self.ctx.client.positions(Some(&symbol)).await?;
        let held = positions
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(&symbol) && p.is_open());

        match held {
            Some(p) => {
                if !self.position_open() {
                    info!(
                        bot = %self.id,
                        symbol = %symbol,
                        amount = %p.amount,
                        entry = %p.entry_price,
                        "Adopted exchange position"
                    );
                }
                self.side = p.side();
                self.quantity = p.amount;
                self.entry_price = p.entry_price;
                if self.entry_base_price.is_zero() {
                    self.entry_base_price = p.entry_price;
                }
                self.status = BotStatus::Open;
            }
            None => {
                if self.position_open() {
                    info!(bot = %self.id, symbol = %symbol, "Exchange shows no position, resetting");
                }
                self.reset_position();
            }
        }

        Ok(())
    }

    // ==================== Entry ====================

    async fn attempt_entry(&mut self, now: Instant) {
        let Some(symbol) = self.symbol.clone() else {
            return;
        };

        let target = self.next_direction().await;
        let signal = self.ctx.selector.signals().volume_signal(&symbol).await;

        if signal != Some(target) {
            info!(
                bot = %self.id,
                symbol = %symbol,
                direction = %target,
                signal = ?signal,
                "Signal no longer matches direction, releasing symbol"
            );
            self.release_symbol().await;
            return;
        }

        self.last_trade_attempt = Some(now);

        match self.try_open_position(target).await {
            EntryOutcome::Opened => {}
            EntryOutcome::Skipped(reason) => {
                debug!(bot = %self.id, symbol = %symbol, reason = %reason, "Entry skipped");
            }
            EntryOutcome::Abandon(reason) => {
                info!(bot = %self.id, symbol = %symbol, reason = %reason, "Abandoning symbol");
                self.release_symbol().await;
            }
        }
    }

    /// Open a position under the symbol's exclusive lock.
    pub async fn try_open_position(&mut self, side: TradeSide) -> EntryOutcome {
        let Some(symbol) = self.symbol.clone() else {
            return EntryOutcome::Skipped("no symbol".to_string());
        };

        let lock = self.ctx.locks.lock_for(&symbol);
        let _guard = lock.lock().await;

        self.open_position_locked(&symbol, side).await
    }

    async fn open_position_locked(&mut self, symbol: &str, side: TradeSide) -> EntryOutcome {
        if let Err(e) = self.sync_position().await {
            return EntryOutcome::Skipped(format!("position check failed: {}", e));
        }
        if self.position_open() {
            return EntryOutcome::Skipped("position already open".to_string());
        }

        let leverage = self.config.leverage;
        match self.ctx.selector.signals().symbol_leverage(symbol).await {
            Ok(max) if max >= leverage => {}
            Ok(max) => return EntryOutcome::Abandon(format!("max leverage {}x below {}x", max, leverage)),
            Err(e) => return EntryOutcome::Abandon(format!("leverage query failed: {}", e)),
        }

        if let Err(e) = self.ctx.client.set_leverage(symbol, leverage).await {
            return EntryOutcome::Abandon(format!("set leverage failed: {}", e));
        }

        let balance = match self.ctx.client.balance().await {
            Ok(b) if b > Decimal::ZERO => b,
            Ok(_) => return EntryOutcome::Skipped("no available balance".to_string()),
            Err(e) => return EntryOutcome::Skipped(format!("balance unavailable: {}", e)),
        };

        let price = match self.ctx.client.current_price(symbol).await {
            Ok(p) if p > Decimal::ZERO => p,
            Ok(p) => return EntryOutcome::Abandon(format!("invalid price {}", p)),
            Err(e) => return EntryOutcome::Skipped(format!("price unavailable: {}", e)),
        };
        self.last_price = Some(price);

        let step = match self.ctx.client.step_size(symbol).await {
            Ok(s) => s,
            Err(e) => return EntryOutcome::Skipped(format!("step size unavailable: {}", e)),
        };

        let quantity = size_quantity(balance, self.config.percent, leverage, price, step);
        if !meets_minimum(quantity, step) {
            return EntryOutcome::Abandon(format!("quantity {} below step {}", quantity, step));
        }

        if let Err(e) = self.ctx.client.cancel_all_orders(symbol).await {
            debug!(bot = %self.id, symbol = %symbol, error = %e, "Failed to cancel stale orders");
        }
        tokio::time::sleep(self.ctx.timings.order_settle).await;

        let fill = match self.ctx.client.place_order(symbol, side, quantity).await {
            Ok(f) => f,
            Err(e) => return EntryOutcome::Abandon(format!("order rejected: {}", e)),
        };

        let filled = if fill.executed_quantity > Decimal::ZERO {
            fill.executed_quantity
        } else {
            quantity
        };
        let fill_price = if fill.avg_price > Decimal::ZERO {
            fill.avg_price
        } else {
            price
        };

        self.clear_position_state();
        self.side = side.into();
        self.quantity = side.sign() * filled;
        self.entry_price = fill_price;
        self.entry_base_price = fill_price;
        self.status = BotStatus::Open;

        info!(
            bot = %self.id,
            symbol = %symbol,
            side = %side,
            quantity = %filled,
            entry = %fill_price,
            leverage,
            order_id = %fill.order_id,
            "Position opened"
        );

        EntryOutcome::Opened
    }

    // ==================== Averaging down ====================

    async fn check_averaging_down(&mut self, now: Instant) {
        if !self.position_open()
            || self.entry_base_price <= Decimal::ZERO
            || self.average_down_count >= self.ctx.trading.max_average_down
        {
            return;
        }
        if !due(self.last_average_down, now, self.ctx.timings.average_down_cooldown) {
            return;
        }
        let Some(symbol) = self.symbol.clone() else {
            return;
        };

        let price = match self.ctx.client.current_price(&symbol).await {
            Ok(p) if p > Decimal::ZERO => p,
            Ok(_) => return,
            Err(e) => {
                debug!(bot = %self.id, symbol = %symbol, error = %e, "Price unavailable for averaging down");
                return;
            }
        };
        self.last_price = Some(price);

        let Some(roi) = roi_percent(
            self.side,
            self.entry_base_price,
            price,
            self.quantity,
            self.config.leverage,
        ) else {
            return;
        };

        if !should_average_down(
            roi,
            self.average_down_count,
            self.ctx.trading.max_average_down,
            &self.ctx.trading.average_down_ladder,
        ) {
            return;
        }

        match self.execute_average_down(&symbol).await {
            Ok(true) => {
                self.average_down_count += 1;
                self.last_average_down = Some(now);
                info!(
                    bot = %self.id,
                    symbol = %symbol,
                    roi = %roi.round_dp(2),
                    count = self.average_down_count,
                    quantity = %self.quantity,
                    entry = %self.entry_price,
                    "Averaged down"
                );
            }
            Ok(false) => {}
            Err(e) => warn!(bot = %self.id, symbol = %symbol, error = %e, "Averaging down failed"),
        }
    }

    /// Add `percent * (count + 1)` of balance to the position.
    async fn execute_average_down(&mut self, symbol: &str) -> Result<bool> {
        let side = self
            .side
            .entry_side()
            .ok_or_else(|| anyhow!("no position side"))?;

        let balance = self.ctx.client.balance().await?;
        if balance <= Decimal::ZERO {
            return Ok(false);
        }

        let price = self.ctx.client.current_price(symbol).await?;
        if price <= Decimal::ZERO {
            return Ok(false);
        }

        let percent = self.config.percent * Decimal::from(self.average_down_count + 1);
        let step = self.ctx.client.step_size(symbol).await?;
        let quantity = size_quantity(balance, percent, self.config.leverage, price, step);
        if !meets_minimum(quantity, step) {
            debug!(bot = %self.id, symbol = %symbol, quantity = %quantity, "Re-entry below one step");
            return Ok(false);
        }

        let fill = self.ctx.client.place_order(symbol, side, quantity).await?;
        let filled = if fill.executed_quantity > Decimal::ZERO {
            fill.executed_quantity
        } else {
            quantity
        };
        let fill_price = if fill.avg_price > Decimal::ZERO {
            fill.avg_price
        } else {
            price
        };

        self.entry_price = blended_entry(self.quantity, self.entry_price, filled, fill_price);
        self.quantity = side.sign() * (self.quantity.abs() + filled);
        Ok(true)
    }

    // ==================== Exit ====================

    async fn check_tp_sl(&mut self, now: Instant) {
        if !self.position_open() || self.entry_price <= Decimal::ZERO {
            return;
        }
        let Some(symbol) = self.symbol.clone() else {
            return;
        };

        let price = match self.ctx.client.current_price(&symbol).await {
            Ok(p) if p > Decimal::ZERO => p,
            Ok(_) => return,
            Err(e) => {
                debug!(bot = %self.id, symbol = %symbol, error = %e, "Price unavailable for TP/SL");
                return;
            }
        };
        self.last_price = Some(price);

        let Some(roi) = roi_percent(
            self.side,
            self.entry_price,
            price,
            self.quantity,
            self.config.leverage,
        ) else {
            return;
        };

        if roi > self.high_water_mark_roi {
            self.high_water_mark_roi = roi;
        }

        if let Some(trigger) = self.config.roi_trigger {
            if !self.roi_check_activated && self.high_water_mark_roi >= trigger {
                self.roi_check_activated = true;
                info!(
                    bot = %self.id,
                    symbol = %symbol,
                    high_water_mark = %self.high_water_mark_roi.round_dp(2),
                    "ROI trigger reached"
                );
            }
        }

        let decision = evaluate_exit(roi, self.config.take_profit, self.config.stop_loss);
        if decision.should_exit() {
            self.close_position(decision, roi, now).await;
        }
    }

    /// Submit a market order that flattens the position. Returns whether an
    /// order was accepted.
    async fn close_position(&mut self, reason: ExitDecision, roi: Decimal, now: Instant) -> bool {
        let Some(symbol) = self.symbol.clone() else {
            return false;
        };

        if let Err(e) = self.sync_position().await {
            debug!(bot = %self.id, symbol = %symbol, error = %e, "Pre-close reconciliation failed");
        }
        if !self.position_open() || self.quantity.is_zero() {
            return false;
        }
        if self.close_attempted && !due(self.last_close_attempt, now, self.ctx.timings.close_retry) {
            return false;
        }

        let Some(close_side) = self.side.entry_side().map(|s| s.opposite()) else {
            return false;
        };

        self.close_attempted = true;
        self.last_close_attempt = Some(now);

        let quantity = self.quantity.abs();
        let entry = self.entry_price;
        let side = self.side;

        if let Err(e) = self.ctx.client.cancel_all_orders(&symbol).await {
            debug!(bot = %self.id, symbol = %symbol, error = %e, "Failed to cancel orders before close");
        }
        tokio::time::sleep(self.ctx.timings.order_settle).await;

        match self.ctx.client.place_order(&symbol, close_side, quantity).await {
            Ok(fill) => {
                let exit_price = if fill.avg_price > Decimal::ZERO {
                    fill.avg_price
                } else {
                    self.last_price.unwrap_or(entry)
                };
                let pnl = match side {
                    PositionSide::Short => (entry - exit_price) * quantity,
                    _ => (exit_price - entry) * quantity,
                };

                info!(
                    bot = %self.id,
                    symbol = %symbol,
                    reason = reason.as_str(),
                    roi = %roi.round_dp(2),
                    pnl = %pnl.round_dp(4),
                    "Position closed"
                );

                self.last_close = Some(now);
                tokio::time::sleep(self.ctx.timings.close_settle).await;
                self.reconcile_position().await;
                true
            }
            Err(e) => {
                warn!(bot = %self.id, symbol = %symbol, error = %e, "Close order failed, will retry");
                self.close_attempted = false;
                false
            }
        }
    }

    // ==================== Snapshot ====================

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            status: self.status,
            side: self.side,
            leverage: self.config.leverage,
            percent: self.config.percent,
            take_profit: self.config.take_profit,
            stop_loss: self.config.stop_loss,
            roi_trigger: self.config.roi_trigger,
            quantity: self.quantity,
            entry_price: self.entry_price,
            current_price: self.last_price,
            position_open: self.position_open(),
            average_down_count: self.average_down_count,
            high_water_mark_roi: self.high_water_mark_roi,
            roi_check_activated: self.roi_check_activated,
            sentiment: self.sentiment.clone(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use rust_decimal_macros::dec;

    const BTC: &str = "BTCUSDC";

    fn context(mock: &Arc<MockExchange>) -> WorkerContext {
        let client: Arc<dyn ExchangeClient> = mock.clone();
        let trading = TradingConfig::default();
        WorkerContext {
            client: client.clone(),
            prices: mock.clone(),
            registry: Arc::new(SymbolRegistry::new()),
            locks: Arc::new(SymbolLockTable::new()),
            selector: Arc::new(CoinSelector::with_seed(client, &trading, 1)),
            trading,
            timings: WorkerTimings::default().without_settle_delays(),
        }
    }

    fn config(leverage: u32, percent: Decimal) -> WorkerConfig {
        WorkerConfig {
            leverage,
            percent,
            take_profit: dec!(5),
            stop_loss: Some(dec!(2)),
            roi_trigger: Some(dec!(3)),
        }
    }

    /// Market with BTC signalling BUY and the account leaning long.
    fn bullish_market() -> Arc<MockExchange> {
        let mock = Arc::new(MockExchange::new());
        mock.list_symbol(BTC, dec!(100), Some(TradeSide::Buy));
        mock.set_position("LONGUSDC", dec!(1), dec!(10));
        mock.set_unrealized_pnl("LONGUSDC", dec!(5));
        mock
    }

    async fn started(mock: &Arc<MockExchange>, ctx: &WorkerContext, cfg: WorkerConfig) -> BotWorker {
        let mut worker = BotWorker::new("w1".to_string(), Some(BTC.to_string()), cfg, ctx.clone())
            .with_seed(3);
        worker.initialize().await;
        assert!(mock.is_subscribed(BTC));
        worker
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_take_profit_scenario() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;
        assert_eq!(worker.status, BotStatus::Waiting);

        let t0 = Instant::now();
        worker.tick(t0).await;

        // 1000 * 1% * 10x / 100 = 1
        assert_eq!(worker.status, BotStatus::Open);
        assert_eq!(worker.quantity, dec!(1));
        assert_eq!(worker.entry_price, dec!(100));
        assert_eq!(mock.leverage_set(BTC), Some(10));

        // ROI 4.5%: hold
        mock.set_price(BTC, dec!(100.45));
        worker.tick(t0 + secs(1)).await;
        assert_eq!(worker.status, BotStatus::Open);
        assert_eq!(worker.high_water_mark_roi, dec!(4.5));
        assert!(worker.roi_check_activated);
        assert_eq!(mock.orders().len(), 1);

        // ROI 5%: take profit
        mock.set_price(BTC, dec!(100.5));
        worker.tick(t0 + secs(2)).await;

        let orders = mock.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, TradeSide::Sell);
        assert_eq!(orders[1].quantity, dec!(1));
        assert_eq!(worker.status, BotStatus::Waiting);
        assert_eq!(worker.symbol.as_deref(), Some(BTC));
        assert!(mock.position(BTC).is_none());
        assert!(!worker.close_attempted);
    }

    #[tokio::test]
    async fn test_stop_loss_closes_short() {
        let mock = Arc::new(MockExchange::new());
        mock.list_symbol(BTC, dec!(100), Some(TradeSide::Sell));
        mock.set_position("SHORTUSDC", dec!(-1), dec!(10));
        mock.set_unrealized_pnl("SHORTUSDC", dec!(5));
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        assert_eq!(worker.side, PositionSide::Short);
        assert_eq!(worker.quantity, dec!(-1));

        // Price up 0.2% on a 10x short: ROI -2%
        mock.set_price(BTC, dec!(100.2));
        worker.tick(t0 + secs(1)).await;

        let orders = mock.orders();
        assert_eq!(orders.last().map(|o| o.side), Some(TradeSide::Buy));
        assert_eq!(worker.status, BotStatus::Waiting);
    }

    #[tokio::test]
    async fn test_close_cooldown_blocks_re_entry() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        mock.set_price(BTC, dec!(101));
        worker.tick(t0 + secs(1)).await;
        assert_eq!(worker.status, BotStatus::Waiting);
        assert_eq!(mock.orders().len(), 2);

        mock.set_price(BTC, dec!(100));
        worker.tick(t0 + secs(120)).await;
        assert_eq!(mock.orders().len(), 2);

        worker.tick(t0 + secs(3602)).await;
        assert_eq!(mock.orders().len(), 3);
        assert_eq!(worker.status, BotStatus::Open);
    }

    #[tokio::test]
    async fn test_failed_close_clears_guard() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        assert_eq!(worker.status, BotStatus::Open);

        mock.fail_orders(true);
        mock.set_price(BTC, dec!(101));
        worker.tick(t0 + secs(1)).await;
        assert_eq!(worker.status, BotStatus::Open);
        assert!(!worker.close_attempted);

        mock.fail_orders(false);
        worker.tick(t0 + secs(2)).await;
        assert_eq!(worker.status, BotStatus::Waiting);
        assert!(mock.position(BTC).is_none());
    }

    #[tokio::test]
    async fn test_averaging_down_ladder() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut cfg = config(10, dec!(1));
        cfg.stop_loss = None;
        let mut worker = started(&mock, &ctx, cfg).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        assert_eq!(worker.quantity, dec!(1));

        // -19.9% price on 10x: ROI -199%, below the first rung
        mock.set_price(BTC, dec!(80.1));
        worker.tick(t0 + secs(1)).await;
        assert_eq!(worker.average_down_count, 0);

        // -20%: ROI -200%, first rung; sized at 1% * 1 of balance
        mock.set_price(BTC, dec!(80));
        worker.tick(t0 + secs(2)).await;
        assert_eq!(worker.average_down_count, 1);

        let added = dec!(1.25);
        assert_eq!(mock.orders()[1].quantity, added);
        assert_eq!(worker.quantity, dec!(1) + added);
        assert_eq!(
            worker.entry_price,
            blended_entry(dec!(1), dec!(100), added, dec!(80))
        );
        assert_eq!(worker.entry_base_price, dec!(100));

        // Cooldown holds the next rung back
        mock.set_price(BTC, dec!(70));
        worker.tick(t0 + secs(30)).await;
        assert_eq!(worker.average_down_count, 1);

        worker.tick(t0 + secs(63)).await;
        assert_eq!(worker.average_down_count, 2);
    }

    #[tokio::test]
    async fn test_averaging_down_never_exceeds_max() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut cfg = config(50, dec!(1));
        cfg.stop_loss = None;
        let mut worker = started(&mock, &ctx, cfg).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        assert_eq!(worker.status, BotStatus::Open);

        // 50x at 1% of entry: ROI -4950%, beyond every rung
        mock.set_price(BTC, dec!(1));
        for i in 1..=12 {
            worker.tick(t0 + secs(61 * i)).await;
        }

        assert_eq!(worker.average_down_count, 7);
        assert_eq!(mock.orders().len(), 8);
    }

    #[tokio::test]
    async fn test_no_averaging_in_profit() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut cfg = config(10, dec!(1));
        cfg.take_profit = dec!(10000);
        let mut worker = started(&mock, &ctx, cfg).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        mock.set_price(BTC, dec!(150));
        worker.tick(t0 + secs(61)).await;

        assert_eq!(worker.average_down_count, 0);
        assert_eq!(mock.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_undersized_quantity_releases_symbol() {
        let mock = bullish_market();
        mock.set_balance(Some(dec!(0.5)));
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        worker.tick(Instant::now()).await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(worker.symbol.is_none());
        assert!(!ctx.registry.contains(BTC));
        assert!(!mock.is_subscribed(BTC));
        assert!(mock.orders().is_empty());
    }

    #[tokio::test]
    async fn test_leverage_cap_below_config_releases_symbol() {
        let mock = bullish_market();
        mock.set_max_leverage(BTC, 5);
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        worker.tick(Instant::now()).await;

        // Leverage lowered to the cap, then entry abandoned
        assert_eq!(mock.leverage_set(BTC), Some(5));
        assert_eq!(worker.status, BotStatus::Searching);
        assert!(!ctx.registry.contains(BTC));
        assert!(mock.orders().is_empty());
    }

    #[tokio::test]
    async fn test_leverage_failure_releases_symbol() {
        let mock = bullish_market();
        mock.fail_set_leverage(true);
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        worker.tick(Instant::now()).await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_leverage_failure_with_open_position_releases_symbol() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        let t0 = Instant::now();
        worker.tick(t0).await;
        assert_eq!(worker.status, BotStatus::Open);

        mock.fail_set_leverage(true);
        worker.tick(t0 + secs(61)).await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(worker.symbol.is_none());
        assert!(ctx.registry.is_empty());
        assert!(!mock.is_subscribed(BTC));
        assert_eq!(worker.quantity, Decimal::ZERO);
        assert_eq!(worker.average_down_count, 0);
        // Remaining steps skipped: no close order went out
        assert_eq!(mock.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_coarse_step_size_releases_symbol() {
        let mock = bullish_market();
        // 1000 * 1% * 10x / 100 = 1 contract, below a step of 5
        mock.set_step_size(BTC, dec!(5));
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        worker.tick(Instant::now()).await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(!ctx.registry.contains(BTC));
        assert!(mock.orders().is_empty());
    }

    #[tokio::test]
    async fn test_signal_mismatch_releases_symbol() {
        let mock = bullish_market();
        mock.set_candles(BTC, crate::api::mock::signal_candles(None));
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        worker.tick(Instant::now()).await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(ctx.registry.is_empty());
        assert!(mock.orders().is_empty());
    }

    #[tokio::test]
    async fn test_static_symbol_with_position_starts_searching() {
        let mock = bullish_market();
        mock.set_position(BTC, dec!(1), dec!(100));
        let ctx = context(&mock);

        let mut worker =
            BotWorker::new("w1".to_string(), Some(BTC.to_string()), config(10, dec!(1)), ctx.clone());
        worker.initialize().await;

        assert_eq!(worker.status, BotStatus::Searching);
        assert!(worker.symbol.is_none());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_static_symbol_already_claimed() {
        let mock = bullish_market();
        let ctx = context(&mock);
        ctx.registry.claim(BTC, "other");

        let mut worker =
            BotWorker::new("w1".to_string(), Some(BTC.to_string()), config(10, dec!(1)), ctx.clone());
        worker.initialize().await;

        assert!(worker.symbol.is_none());
        assert_eq!(ctx.registry.owner_of(BTC).as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_dynamic_workers_never_share_a_symbol() {
        let mock = bullish_market();
        mock.list_symbol("ETHUSDC", dec!(2000), Some(TradeSide::Buy));
        let ctx = context(&mock);

        let mut workers: Vec<BotWorker> = (0..3)
            .map(|i| {
                BotWorker::new(format!("d{}", i), None, config(10, dec!(1)), ctx.clone())
                    .with_seed(i)
            })
            .collect();

        let now = Instant::now();
        for w in workers.iter_mut() {
            w.initialize().await;
            w.tick(now).await;
        }

        let held: Vec<String> = workers.iter().filter_map(|w| w.symbol.clone()).collect();
        assert_eq!(held.len(), 2);
        assert_ne!(held[0], held[1]);
        assert_eq!(ctx.registry.len(), 2);

        let idle = workers.iter().find(|w| w.symbol.is_none()).unwrap();
        assert_eq!(idle.status, BotStatus::Searching);
        assert_eq!(idle.search_retry_at, Some(now + ctx.timings.search_backoff));
    }

    #[tokio::test]
    async fn test_reconcile_adopts_exchange_position() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;

        mock.set_position(BTC, dec!(-2), dec!(100));
        worker.tick(Instant::now()).await;

        assert_eq!(worker.status, BotStatus::Open);
        assert_eq!(worker.side, PositionSide::Short);
        assert_eq!(worker.quantity, dec!(-2));
        assert!(mock.orders().is_empty());

        mock.clear_position(BTC);
        worker.reconcile_position().await;
        assert_eq!(worker.status, BotStatus::Waiting);
        assert_eq!(worker.symbol.as_deref(), Some(BTC));
        assert_eq!(worker.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_releases_even_if_cancel_fails() {
        let mock = bullish_market();
        mock.fail_cancel(true);
        let ctx = context(&mock);
        let mut worker = started(&mock, &ctx, config(10, dec!(1))).await;
        assert!(ctx.registry.contains(BTC));

        worker.shutdown().await;

        assert!(!ctx.registry.contains(BTC));
        assert!(!mock.is_subscribed(BTC));
        assert!(worker.symbol.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_request_and_publishes() {
        let mock = bullish_market();
        let ctx = context(&mock);
        let worker =
            BotWorker::new("w1".to_string(), Some(BTC.to_string()), config(10, dec!(1)), ctx.clone());
        let handle = worker.handle();

        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.snapshot().status, BotStatus::Open);

        handle.request_stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert!(ctx.registry.is_empty());
        assert!(mock.cancelled().contains(&BTC.to_string()));
        assert!(handle.snapshot().symbol.is_none());
    }
}
