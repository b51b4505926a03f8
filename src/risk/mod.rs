// Risk management: entry gates and protective order levels
pub mod levels;
pub mod limits;

pub use levels::{protective_levels, round_price, ProtectiveLevels};
pub use limits::{TradeBlock, TradeLimits, TradingState};
