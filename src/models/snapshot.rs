//! Read-only snapshots published by workers and the orchestrator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExchangePosition, PositionSide, TradeSide};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    /// No symbol held
    #[default]
    Searching,
    /// Symbol held, no position
    Waiting,
    /// Position held
    Open,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Searching => "searching",
            BotStatus::Waiting => "waiting",
            BotStatus::Open => "open",
        }
    }
}

/// Long/short exposure of the whole account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub long_count: usize,
    pub short_count: usize,
    pub long_pnl: Decimal,
    pub short_pnl: Decimal,
    /// Margin committed to long positions
    pub long_value: Decimal,
    /// Margin committed to short positions
    pub short_value: Decimal,
    pub computed_at: Option<DateTime<Utc>>,
}

impl SentimentSnapshot {
    /// Sum every open position into long and short buckets.
    pub fn from_positions(positions: &[ExchangePosition]) -> Self {
        let mut snapshot = Self {
            computed_at: Some(Utc::now()),
            ..Default::default()
        };

        for pos in positions {
            match pos.side() {
                PositionSide::Long => {
                    snapshot.long_count += 1;
                    snapshot.long_pnl += pos.unrealized_pnl;
                    snapshot.long_value += pos.margin_value();
                }
                PositionSide::Short => {
                    snapshot.short_count += 1;
                    snapshot.short_pnl += pos.unrealized_pnl;
                    snapshot.short_value += pos.margin_value();
                }
                PositionSide::Flat => {}
            }
        }

        snapshot
    }

    /// Direction favoured by unrealized PnL, or `None` on an exact tie.
    pub fn leaning(&self) -> Option<TradeSide> {
        if self.long_pnl > self.short_pnl {
            Some(TradeSide::Buy)
        } else if self.short_pnl > self.long_pnl {
            Some(TradeSide::Sell)
        } else {
            None
        }
    }
}

/// Public state of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub symbol: Option<String>,
    pub status: BotStatus,
    pub side: PositionSide,
    pub leverage: u32,
    pub percent: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Option<Decimal>,
    pub roi_trigger: Option<Decimal>,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub position_open: bool,
    pub average_down_count: u32,
    pub high_water_mark_roi: Decimal,
    pub roi_check_activated: bool,
    pub sentiment: SentimentSnapshot,
}

/// Account-wide summary across all workers and positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    pub balance: Decimal,
    pub total_bots: usize,
    pub searching_bots: usize,
    pub waiting_bots: usize,
    pub trading_bots: usize,
    pub total_long_count: usize,
    pub total_short_count: usize,
    pub total_long_pnl: Decimal,
    pub total_short_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub uptime_secs: i64,
}

impl std::fmt::Display for SystemSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Account Summary ===")?;
        writeln!(f, "Balance:          ${:.2}", self.balance)?;
        writeln!(
            f,
            "Bots:             {} (searching: {}, waiting: {}, trading: {})",
            self.total_bots, self.searching_bots, self.waiting_bots, self.trading_bots
        )?;
        writeln!(
            f,
            "Long positions:   {} (P&L: ${:.2})",
            self.total_long_count, self.total_long_pnl
        )?;
        writeln!(
            f,
            "Short positions:  {} (P&L: ${:.2})",
            self.total_short_count, self.total_short_pnl
        )?;
        writeln!(f, "Unrealized P&L:   ${:.2}", self.total_unrealized_pnl)?;
        writeln!(f, "Uptime:           {}s", self.uptime_secs)?;
        Ok(())
    }
}
