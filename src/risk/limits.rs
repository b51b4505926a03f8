use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Entry gates checked before a new position may be opened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLimits {
    pub max_daily_trades: u32,
}

impl Default for TradeLimits {
    fn default() -> Self {
        Self {
            max_daily_trades: 5, // Max 5 entries per UTC day
        }
    }
}

/// Counters the limits are checked against
#[derive(Debug, Clone, PartialEq)]
pub struct TradingState {
    pub daily_trades: u32,
    pub trading_day: NaiveDate,
}

impl TradingState {
    pub fn new(trading_day: NaiveDate, daily_trades: u32) -> Self {
        Self {
            daily_trades,
            trading_day,
        }
    }

    /// Reset the daily counter if `day` is later than the current trading day.
    /// Returns true when the day rolled over.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        if day > self.trading_day {
            self.trading_day = day;
            self.daily_trades = 0;
            true
        } else {
            false
        }
    }

    pub fn record_entry(&mut self) {
        self.daily_trades = self.daily_trades.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeBlock {
    PositionOpen,
    DailyTradeLimit,
}

impl TradeLimits {
    pub fn check(&self, has_open_position: bool, state: &TradingState) -> Result<(), TradeBlock> {
        if has_open_position {
            return Err(TradeBlock::PositionOpen);
        }

        if state.daily_trades >= self.max_daily_trades {
            return Err(TradeBlock::DailyTradeLimit);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[test]
    fn test_open_position_blocks() {
        let limits = TradeLimits::default();
        let state = TradingState::new(day(1), 0);
        assert_eq!(limits.check(true, &state), Err(TradeBlock::PositionOpen));
    }

    #[test]
    fn test_daily_limit_blocks_at_ceiling() {
        let limits = TradeLimits {
            max_daily_trades: 2,
        };
        let mut state = TradingState::new(day(1), 0);

        assert!(limits.check(false, &state).is_ok());
        state.record_entry();
        assert!(limits.check(false, &state).is_ok());
        state.record_entry();
        assert_eq!(limits.check(false, &state), Err(TradeBlock::DailyTradeLimit));
    }

    #[test]
    fn test_zero_ceiling_never_trades() {
        let limits = TradeLimits {
            max_daily_trades: 0,
        };
        let state = TradingState::new(day(1), 0);
        assert_eq!(limits.check(false, &state), Err(TradeBlock::DailyTradeLimit));
    }

    #[test]
    fn test_roll_day_resets_counter_only_forward() {
        let mut state = TradingState::new(day(2), 4);

        assert!(!state.roll_day(day(2)));
        assert!(!state.roll_day(day(1))); // Late bar from yesterday
        assert_eq!(state.daily_trades, 4);

        assert!(state.roll_day(day(3)));
        assert_eq!(state.daily_trades, 0);
        assert_eq!(state.trading_day, day(3));
    }
}
