//! Worker, timing and market configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Risk parameters of one worker, fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Requested leverage
    pub leverage: u32,

    /// Percentage of available balance committed per entry
    pub percent: Decimal,

    /// ROI percentage at which the position is closed in profit
    pub take_profit: Decimal,

    /// ROI percentage loss at which the position is closed; `None` disables it
    pub stop_loss: Option<Decimal>,

    /// High-water-mark ROI that flips the activation flag
    pub roi_trigger: Option<Decimal>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            leverage: 10,
            percent: dec!(5),      // 5% of balance per entry
            take_profit: dec!(100), // close at +100% ROI
            stop_loss: None,
            roi_trigger: None,
        }
    }
}

/// Cadences and cooldowns of the worker control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTimings {
    pub tick: Duration,
    pub leverage_check: Duration,
    pub sentiment_refresh: Duration,
    pub position_check: Duration,
    /// Minimum gap between two entry attempts
    pub trade_retry: Duration,
    /// Quiet period after a close before a new entry
    pub close_cooldown: Duration,
    /// Window during which a pending close is not resubmitted
    pub close_retry: Duration,
    pub average_down_cooldown: Duration,
    /// Pause after a failed coin search
    pub search_backoff: Duration,
    /// Delay between cancelling stale orders and submitting a new one
    pub order_settle: Duration,
    /// Delay before reconciling after a close
    pub close_settle: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            leverage_check: Duration::from_secs(60),
            sentiment_refresh: Duration::from_secs(10),
            position_check: Duration::from_secs(30),
            trade_retry: Duration::from_secs(60),
            close_cooldown: Duration::from_secs(3600),
            close_retry: Duration::from_secs(30),
            average_down_cooldown: Duration::from_secs(60),
            search_backoff: Duration::from_secs(5),
            order_settle: Duration::from_millis(200),
            close_settle: Duration::from_secs(2),
        }
    }
}

impl WorkerTimings {
    /// Same cadences without any settle sleeps.
    pub fn without_settle_delays(mut self) -> Self {
        self.order_settle = Duration::ZERO;
        self.close_settle = Duration::ZERO;
        self
    }
}

/// Market-wide constants shared by every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Quote asset of the instrument universe and of the balance
    pub quote_asset: String,

    /// Kline interval for the volume signal
    pub candle_interval: String,

    /// Candles fetched per signal evaluation
    pub candle_limit: u32,

    /// Instruments scanned per coin search
    pub universe_limit: usize,

    /// Maximum number of averaging-down re-entries
    pub max_average_down: u32,

    /// Adverse ROI (percent) required for each successive re-entry
    pub average_down_ladder: Vec<Decimal>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDC".to_string(),
            candle_interval: "5m".to_string(),
            candle_limit: 10,
            universe_limit: 100,
            max_average_down: 7,
            average_down_ladder: vec![
                dec!(200),
                dec!(300),
                dec!(500),
                dec!(800),
                dec!(1300),
                dec!(2100),
                dec!(3400),
            ],
        }
    }
}
