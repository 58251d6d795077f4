//! Currency rounding

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of decimal places kept for currency amounts
pub const CURRENCY_SCALE: u32 = 2;

/// Round an amount to currency precision, half-up (away from zero)
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}
