//! Scans the instrument universe for a symbol matching a trade direction.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::api::ExchangeClient;
use crate::models::TradeSide;

use super::{MarketSignalProvider, TradingConfig};

/// Picks one eligible symbol uniformly at random among all that pass the
/// filters, spreading workers over the eligible set.
pub struct CoinSelector {
    client: Arc<dyn ExchangeClient>,
    signals: MarketSignalProvider,
    universe_limit: usize,
    rng: Mutex<StdRng>,
}

impl CoinSelector {
    pub fn new(client: Arc<dyn ExchangeClient>, config: &TradingConfig) -> Self {
        Self::with_rng(client, config, StdRng::from_entropy())
    }

    /// Deterministic selection for tests.
    pub fn with_seed(client: Arc<dyn ExchangeClient>, config: &TradingConfig, seed: u64) -> Self {
        Self::with_rng(client, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(client: Arc<dyn ExchangeClient>, config: &TradingConfig, rng: StdRng) -> Self {
        Self {
            signals: MarketSignalProvider::new(client.clone(), config),
            client,
            universe_limit: config.universe_limit,
            rng: Mutex::new(rng),
        }
    }

    pub fn signals(&self) -> &MarketSignalProvider {
        &self.signals
    }

    /// Every symbol that currently passes all filters, in universe order.
    pub async fn eligible_candidates(
        &self,
        target: TradeSide,
        excluded: &HashSet<String>,
        required_leverage: u32,
    ) -> Vec<String> {
        let universe = match self.client.tradable_instruments(self.universe_limit).await {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "Instrument universe unavailable");
                return Vec::new();
            }
        };

        let mut eligible = Vec::new();

        for symbol in universe {
            if excluded.contains(&symbol) {
                continue;
            }

            match self.client.positions(Some(&symbol)).await {
                Ok(positions) if positions.iter().any(|p| p.is_open()) => continue,
                Ok(_) => {}
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "Position check failed, skipping");
                    continue;
                }
            }

            match self.signals.symbol_leverage(&symbol).await {
                Ok(max) if max >= required_leverage => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "Leverage query failed, skipping");
                    continue;
                }
            }

            if self.signals.volume_signal(&symbol).await == Some(target) {
                eligible.push(symbol);
            }
        }

        eligible
    }

    /// One eligible symbol chosen uniformly at random, or `None`.
    pub async fn find_best_coin(
        &self,
        target: TradeSide,
        excluded: &HashSet<String>,
        required_leverage: u32,
    ) -> Option<String> {
        let eligible = self
            .eligible_candidates(target, excluded, required_leverage)
            .await;

        let chosen = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            eligible.choose(&mut *rng).cloned()
        };

        if let Some(symbol) = &chosen {
            info!(
                symbol = %symbol,
                direction = %target,
                candidates = eligible.len(),
                "Coin selected"
            );
        }

        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use rust_decimal_macros::dec;

    fn market() -> Arc<MockExchange> {
        let mock = Arc::new(MockExchange::new());
        mock.list_symbol("AAAUSDC", dec!(1), Some(TradeSide::Buy));
        mock.list_symbol("BBBUSDC", dec!(2), Some(TradeSide::Buy));
        mock.list_symbol("CCCUSDC", dec!(3), Some(TradeSide::Sell));
        mock.list_symbol("DDDUSDC", dec!(4), None);
        mock.list_symbol("EEEUSDC", dec!(5), Some(TradeSide::Buy));
        mock
    }

    #[tokio::test]
    async fn test_filters_by_direction() {
        let mock = market();
        let selector = CoinSelector::with_seed(mock, &TradingConfig::default(), 7);

        let buys = selector
            .eligible_candidates(TradeSide::Buy, &HashSet::new(), 10)
            .await;
        assert_eq!(buys, vec!["AAAUSDC", "BBBUSDC", "EEEUSDC"]);

        let sells = selector
            .eligible_candidates(TradeSide::Sell, &HashSet::new(), 10)
            .await;
        assert_eq!(sells, vec!["CCCUSDC"]);
    }

    #[tokio::test]
    async fn test_excluded_and_held_symbols_never_returned() {
        let mock = market();
        mock.set_position("BBBUSDC", dec!(3), dec!(2));
        let selector = CoinSelector::with_seed(mock, &TradingConfig::default(), 1);

        let excluded: HashSet<String> = ["AAAUSDC".to_string()].into_iter().collect();
        for _ in 0..20 {
            let chosen = selector.find_best_coin(TradeSide::Buy, &excluded, 10).await;
            assert_eq!(chosen.as_deref(), Some("EEEUSDC"));
        }
    }

    #[tokio::test]
    async fn test_leverage_cap_filters() {
        let mock = market();
        mock.set_max_leverage("AAAUSDC", 5);
        mock.set_max_leverage("EEEUSDC", 20);
        let selector = CoinSelector::with_seed(mock, &TradingConfig::default(), 3);

        let eligible = selector
            .eligible_candidates(TradeSide::Buy, &HashSet::new(), 20)
            .await;
        assert_eq!(eligible, vec!["BBBUSDC", "EEEUSDC"]);
    }

    #[tokio::test]
    async fn test_random_choice_spreads_over_candidates() {
        let mock = market();
        let selector = CoinSelector::with_seed(mock, &TradingConfig::default(), 42);

        let mut seen = HashSet::new();
        for _ in 0..50 {
            if let Some(s) = selector.find_best_coin(TradeSide::Buy, &HashSet::new(), 10).await {
                seen.insert(s);
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_same_seed_same_choice() {
        let a = CoinSelector::with_seed(market(), &TradingConfig::default(), 99);
        let b = CoinSelector::with_seed(market(), &TradingConfig::default(), 99);

        for _ in 0..5 {
            assert_eq!(
                a.find_best_coin(TradeSide::Buy, &HashSet::new(), 10).await,
                b.find_best_coin(TradeSide::Buy, &HashSet::new(), 10).await
            );
        }
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let mock = Arc::new(MockExchange::new());
        mock.list_symbol("DDDUSDC", dec!(4), None);
        mock.list_symbol("XXXUSDC", dec!(4), Some(TradeSide::Sell));
        let selector = CoinSelector::with_seed(mock, &TradingConfig::default(), 5);

        assert_eq!(
            selector.find_best_coin(TradeSide::Buy, &HashSet::new(), 10).await,
            None
        );
    }
}
