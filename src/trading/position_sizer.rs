//! Order quantity sizing and blended entry price after re-entries.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Quantity for committing `percent` of `balance` at `leverage`, rounded
/// down to a multiple of `step_size`.
///
/// quantity = floor(balance * percent / 100 * leverage / price / step) * step
///
/// Returns zero when the price is not positive. A non-positive step skips rounding.
pub fn size_quantity(
    balance: Decimal,
    percent: Decimal,
    leverage: u32,
    price: Decimal,
    step_size: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO || balance <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let notional = balance * percent / dec!(100) * Decimal::from(leverage);
    let raw = notional / price;

    if step_size <= Decimal::ZERO {
        return raw.normalize();
    }

    ((raw / step_size).floor() * step_size).normalize()
}

/// Whether a sized quantity is at least one exchange step.
pub fn meets_minimum(quantity: Decimal, step_size: Decimal) -> bool {
    quantity > Decimal::ZERO && quantity >= step_size
}

/// Notional-weighted average of the held position and a new fill.
pub fn blended_entry(
    held_quantity: Decimal,
    held_entry: Decimal,
    fill_quantity: Decimal,
    fill_price: Decimal,
) -> Decimal {
    let held = held_quantity.abs();
    let total = held + fill_quantity;
    if total.is_zero() {
        return held_entry;
    }
    (held * held_entry + fill_quantity * fill_price) / total
}
