//! Risk rules for an open leveraged position.
//!
//! This module defines:
//! - ROI on committed margin
//! - Take-profit / stop-loss exit decisions
//! - The escalating adverse-ROI ladder for averaging down

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::PositionSide;

/// Return on committed margin, in percent.
///
/// `None` when there is no position or the invested margin is not positive.
pub fn roi_percent(
    side: PositionSide,
    entry_price: Decimal,
    current_price: Decimal,
    quantity: Decimal,
    leverage: u32,
) -> Option<Decimal> {
    if leverage == 0 {
        return None;
    }

    let size = quantity.abs();
    let profit = match side {
        PositionSide::Long => (current_price - entry_price) * size,
        PositionSide::Short => (entry_price - current_price) * size,
        PositionSide::Flat => return None,
    };

    let invested = entry_price * size / Decimal::from(leverage);
    if invested <= Decimal::ZERO {
        return None;
    }

    Some(profit / invested * dec!(100))
}

/// Outcome of a take-profit / stop-loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitDecision {
    Hold,
    TakeProfit,
    StopLoss,
}

impl ExitDecision {
    pub fn should_exit(&self) -> bool {
        !matches!(self, ExitDecision::Hold)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitDecision::Hold => "hold",
            ExitDecision::TakeProfit => "take_profit",
            ExitDecision::StopLoss => "stop_loss",
        }
    }
}

/// Take profit wins over stop loss; a stop loss of zero or less never fires.
pub fn evaluate_exit(roi: Decimal, take_profit: Decimal, stop_loss: Option<Decimal>) -> ExitDecision {
    if roi >= take_profit {
        return ExitDecision::TakeProfit;
    }

    match stop_loss {
        Some(sl) if sl > Decimal::ZERO && roi <= -sl => ExitDecision::StopLoss,
        _ => ExitDecision::Hold,
    }
}

/// Whether the adverse ROI has reached the ladder rung for the next re-entry.
pub fn should_average_down(
    roi: Decimal,
    average_down_count: u32,
    max_average_down: u32,
    ladder: &[Decimal],
) -> bool {
    if roi >= Decimal::ZERO || average_down_count >= max_average_down {
        return false;
    }

    match ladder.get(average_down_count as usize) {
        Some(level) => roi.abs() >= *level,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<Decimal> {
        crate::trading::TradingConfig::default().average_down_ladder
    }

    #[test]
    fn test_roi_sign_correct() {
        // entry 100, price 110, qty 1, 10x long: profit 10 on margin 10
        assert_eq!(
            roi_percent(PositionSide::Long, dec!(100), dec!(110), dec!(1), 10),
            Some(dec!(100))
        );
        assert_eq!(
            roi_percent(PositionSide::Short, dec!(100), dec!(110), dec!(-1), 10),
            Some(dec!(-100))
        );
        assert_eq!(
            roi_percent(PositionSide::Short, dec!(100), dec!(90), dec!(-1), 10),
            Some(dec!(100))
        );
    }

    #[test]
    fn test_roi_undefined_without_margin() {
        assert_eq!(roi_percent(PositionSide::Long, dec!(0), dec!(110), dec!(1), 10), None);
        assert_eq!(roi_percent(PositionSide::Flat, dec!(100), dec!(110), dec!(1), 10), None);
        assert_eq!(roi_percent(PositionSide::Long, dec!(100), dec!(110), dec!(0), 10), None);
    }

    #[test]
    fn test_take_profit_threshold() {
        let roi = roi_percent(PositionSide::Long, dec!(100), dec!(104.5), dec!(1), 10).unwrap();
        assert_eq!(roi, dec!(45));
        assert_eq!(evaluate_exit(dec!(4.5), dec!(5), Some(dec!(2))), ExitDecision::Hold);
        assert_eq!(evaluate_exit(dec!(5), dec!(5), Some(dec!(2))), ExitDecision::TakeProfit);
    }

    #[test]
    fn test_stop_loss_threshold() {
        assert_eq!(evaluate_exit(dec!(-1.99), dec!(5), Some(dec!(2))), ExitDecision::Hold);
        assert_eq!(evaluate_exit(dec!(-2), dec!(5), Some(dec!(2))), ExitDecision::StopLoss);
        assert_eq!(evaluate_exit(dec!(-500), dec!(5), None), ExitDecision::Hold);
        assert_eq!(evaluate_exit(dec!(-500), dec!(5), Some(Decimal::ZERO)), ExitDecision::Hold);
    }

    #[test]
    fn test_ladder_boundary() {
        assert!(should_average_down(dec!(-200), 0, 7, &ladder()));
        assert!(!should_average_down(dec!(-199), 0, 7, &ladder()));
        assert!(!should_average_down(dec!(-250), 1, 7, &ladder()));
        assert!(should_average_down(dec!(-300), 1, 7, &ladder()));
    }

    #[test]
    fn test_never_averages_with_non_negative_roi() {
        assert!(!should_average_down(Decimal::ZERO, 0, 7, &ladder()));
        assert!(!should_average_down(dec!(50), 0, 7, &ladder()));
    }

    #[test]
    fn test_never_past_max_re_entries() {
        assert!(should_average_down(dec!(-5000), 6, 7, &ladder()));
        assert!(!should_average_down(dec!(-5000), 7, 7, &ladder()));
        assert!(!should_average_down(dec!(-5000), 3, 3, &ladder()));
    }
}
