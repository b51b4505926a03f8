use super::SignalSource;
use crate::indicators::{calculate_ema, calculate_sma};
use crate::models::{CloseReason, Position, PriceBar, Side};
use serde::{Deserialize, Serialize};

/// Moving-average crossover strategy
///
/// Entry: the fast average crosses the slow one in the direction of the
/// configured side (above for longs, below for shorts).
///
/// Exit (first match wins):
/// - Price at or through the stop-loss
/// - Price at or through the take-profit
/// - Price back through an activated trailing stop
/// - Averages cross back against the position
#[derive(Debug, Clone)]
pub struct SmaCrossStrategy {
    config: SmaCrossConfig,
    side: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmaCrossConfig {
    pub fast_period: usize,
    pub slow_period: usize,

    /// Use EMA instead of SMA for both averages
    pub use_ema: bool,

    /// Favorable move from entry that arms the trailing stop (e.g. 0.02 = 2%)
    pub trailing_activation_pct: f64,

    /// Trailing distance as a fraction of entry price (e.g. 0.01 = 1%)
    pub trailing_distance_pct: f64,
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: 9,
            slow_period: 21,
            use_ema: false,
            trailing_activation_pct: 0.02,
            trailing_distance_pct: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cross {
    Up,
    Down,
}

impl SmaCrossStrategy {
    pub fn new(config: SmaCrossConfig, side: Side) -> Self {
        Self { config, side }
    }

    fn average(&self, closes: &[f64], period: usize) -> Option<f64> {
        if self.config.use_ema {
            calculate_ema(closes, period)
        } else {
            calculate_sma(closes, period)
        }
    }

    /// Crossover between the last two bars, if any
    fn crossover(&self, history: &[PriceBar]) -> Option<Cross> {
        if history.len() < self.required_history_length() {
            return None;
        }

        let closes: Vec<f64> = history.iter().map(|b| b.close).collect();
        let previous = &closes[..closes.len() - 1];

        let fast_now = self.average(&closes, self.config.fast_period)?;
        let slow_now = self.average(&closes, self.config.slow_period)?;
        let fast_prev = self.average(previous, self.config.fast_period)?;
        let slow_prev = self.average(previous, self.config.slow_period)?;

        if fast_prev <= slow_prev && fast_now > slow_now {
            Some(Cross::Up)
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Some(Cross::Down)
        } else {
            None
        }
    }

    /// Arm or ratchet the trailing stop. It only ever moves in the position's favor.
    fn update_trailing_stop(&self, position: &mut Position, current_price: f64) {
        let activation = self.config.trailing_activation_pct;
        let distance = position.entry_price * self.config.trailing_distance_pct;

        let armed = position.trailing_stop_price.is_some()
            || if position.is_long() {
                current_price >= position.entry_price * (1.0 + activation)
            } else {
                current_price <= position.entry_price * (1.0 - activation)
            };
        if !armed || distance <= 0.0 {
            return;
        }

        let candidate = if position.is_long() {
            current_price - distance
        } else {
            current_price + distance
        };

        let next = match position.trailing_stop_price {
            Some(prev) if position.is_long() => prev.max(candidate),
            Some(prev) => prev.min(candidate),
            None => {
                tracing::info!(
                    symbol = %position.symbol,
                    "Trailing stop armed at {:.4} (distance {:.4})",
                    candidate,
                    distance
                );
                candidate
            }
        };

        position.trailing_stop_price = Some(next);
        position.trailing_stop_distance = Some(distance);
    }
}

impl Default for SmaCrossStrategy {
    fn default() -> Self {
        Self::new(SmaCrossConfig::default(), Side::Buy)
    }
}

impl SignalSource for SmaCrossStrategy {
    fn name(&self) -> &str {
        "SmaCrossStrategy"
    }

    fn required_history_length(&self) -> usize {
        // Previous and current value of the slow average
        self.config.slow_period.max(self.config.fast_period) + 1
    }

    fn should_enter(&mut self, history: &[PriceBar], _current_price: f64) -> bool {
        matches!(
            (self.side, self.crossover(history)),
            (Side::Buy, Some(Cross::Up)) | (Side::Sell, Some(Cross::Down))
        )
    }

    fn should_close(
        &mut self,
        position: &mut Position,
        history: &[PriceBar],
        current_price: f64,
    ) -> Option<CloseReason> {
        let long = position.is_long();

        let stop_hit = if long {
            current_price <= position.stop_loss
        } else {
            current_price >= position.stop_loss
        };
        if stop_hit {
            return Some(CloseReason::StopLoss);
        }

        let target_hit = if long {
            current_price >= position.take_profit
        } else {
            current_price <= position.take_profit
        };
        if target_hit {
            return Some(CloseReason::TakeProfit);
        }

        if let Some(trailing) = position.trailing_stop_price {
            let trailing_hit = if long {
                current_price <= trailing
            } else {
                current_price >= trailing
            };
            if trailing_hit {
                return Some(CloseReason::TrailingStop);
            }
        }

        self.update_trailing_stop(position, current_price);

        match (long, self.crossover(history)) {
            (true, Some(Cross::Down)) | (false, Some(Cross::Up)) => Some(CloseReason::StrategyExit),
            _ => None,
        }
    }
}
