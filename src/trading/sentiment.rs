//! Account-wide long/short exposure used to bias the direction of new trades.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::debug;

use crate::api::ExchangeClient;
use crate::models::{SentimentSnapshot, TradeSide};

/// Summarises every open position on the account.
pub struct GlobalSentimentAggregator {
    client: Arc<dyn ExchangeClient>,
}

impl GlobalSentimentAggregator {
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self { client }
    }

    /// Fresh snapshot from the exchange's full position list.
    pub async fn compute(&self) -> Result<SentimentSnapshot> {
        let positions = self
            .client
            .positions(None)
            .await
            .context("Failed to fetch account positions")?;

        let snapshot = SentimentSnapshot::from_positions(&positions);
        debug!(
            long_count = snapshot.long_count,
            short_count = snapshot.short_count,
            long_pnl = %snapshot.long_pnl,
            short_pnl = %snapshot.short_pnl,
            "Sentiment refreshed"
        );
        Ok(snapshot)
    }

    /// Side with the better unrealized PnL; a fair coin flip on a tie.
    pub fn choose_direction<R: Rng + ?Sized>(snapshot: &SentimentSnapshot, rng: &mut R) -> TradeSide {
        snapshot.leaning().unwrap_or_else(|| {
            if rng.gen_bool(0.5) {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            }
        })
    }
}
