use crate::models::Side;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Stop-loss and take-profit trigger prices for a filled entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Round `price` to `precision` decimal places, half away from zero.
///
/// Goes through `Decimal` so that values like 2105.25 round as written
/// rather than as their nearest binary approximation.
pub fn round_price(price: f64, precision: u32) -> f64 {
    let Some(decimal) = Decimal::from_f64(price) else {
        return price;
    };
    decimal
        .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(price)
}

/// Protective levels for an entry on `side` filled at `fill_price`.
///
/// Long: SL below, TP above. Short: mirrored.
pub fn protective_levels(
    fill_price: f64,
    side: Side,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    precision: u32,
) -> ProtectiveLevels {
    let (stop_loss, take_profit) = match side {
        Side::Buy => (
            fill_price * (1.0 - stop_loss_pct),
            fill_price * (1.0 + take_profit_pct),
        ),
        Side::Sell => (
            fill_price * (1.0 + stop_loss_pct),
            fill_price * (1.0 - take_profit_pct),
        ),
    };

    ProtectiveLevels {
        stop_loss: round_price(stop_loss, precision),
        take_profit: round_price(take_profit, precision),
    }
}
