use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side on the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "long")]
    Buy,
    #[serde(alias = "short")]
    Sell,
}

impl Side {
    /// The side that flattens a position opened on `self`
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV kline for one symbol/interval
///
/// `is_final` is false while the interval is still open; such bars are display-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBar {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_final: bool,
}

/// Exchange acknowledgement of a placed or cancelled order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Zero when the exchange did not report a fill price
    pub avg_price: f64,
    pub filled_qty: f64,
    pub status: String,
    pub side: Side,
}

/// Exchange-side view of the position for a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed: positive long, negative short
    pub position_amt: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "Open",
            PositionStatus::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Open" => Some(PositionStatus::Open),
            "Closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    StrategyExit, // Strategy-driven exit signal (e.g., trend reversal)
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "StopLoss",
            CloseReason::TakeProfit => "TakeProfit",
            CloseReason::TrailingStop => "TrailingStop",
            CloseReason::StrategyExit => "StrategyExit",
            CloseReason::Manual => "Manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "StopLoss" => Some(CloseReason::StopLoss),
            "TakeProfit" => Some(CloseReason::TakeProfit),
            "TrailingStop" => Some(CloseReason::TrailingStop),
            "StrategyExit" => Some(CloseReason::StrategyExit),
            "Manual" => Some(CloseReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leveraged trade cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Option<Uuid>, // None until the store has accepted it
    pub symbol: String,
    pub side: Side, // Side of the entry order
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub realized_pnl: Option<f64>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub trailing_stop_price: Option<f64>, // Set by the signal source once activated
    pub trailing_stop_distance: Option<f64>,
}

impl Position {
    /// Build an open position from a filled entry
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        quantity: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            symbol: symbol.into(),
            side,
            entry_price,
            exit_price: None,
            quantity,
            leverage,
            stop_loss,
            take_profit,
            entry_time,
            exit_time: None,
            status: PositionStatus::Open,
            realized_pnl: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            close_reason: None,
            trailing_stop_price: None,
            trailing_stop_distance: None,
        }
    }

    pub fn is_long(&self) -> bool {
        self.side == Side::Buy
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// P&L if the position were closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        let diff = if self.is_long() {
            price - self.entry_price
        } else {
            self.entry_price - price
        };
        diff * self.quantity
    }

    /// Transition to Closed. Terminal: closing twice is an error.
    pub fn close(
        &mut self,
        exit_price: f64,
        reason: CloseReason,
        exit_time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.status == PositionStatus::Closed {
            anyhow::bail!("Position already closed");
        }

        self.realized_pnl = Some(self.pnl_at(exit_price));
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.close_reason = Some(reason);
        self.status = PositionStatus::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::open("ETHUSDT", Side::Buy, 2005.0, 0.5, 5, 1964.9, 2105.25, Utc::now())
    }

    #[test]
    fn test_opposite_side() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_new_position_is_open_without_exit_fields() {
        let position = long_position();

        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.id.is_none());
        assert!(position.exit_price.is_none());
        assert!(position.realized_pnl.is_none());
        assert!(position.close_reason.is_none());
        assert!(position.trailing_stop_price.is_none());
    }

    #[test]
    fn test_pnl_long_and_short() {
        let long = long_position();
        assert_eq!(long.pnl_at(2105.0), 50.0); // 0.5 * (2105 - 2005)

        let mut short = long_position();
        short.side = Side::Sell;
        assert_eq!(short.pnl_at(2105.0), -50.0);
    }

    #[test]
    fn test_close_sets_exit_fields() {
        let mut position = long_position();
        position
            .close(2105.25, CloseReason::TakeProfit, Utc::now())
            .unwrap();

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_price, Some(2105.25));
        assert_eq!(position.realized_pnl, Some(50.125));
        assert_eq!(position.close_reason, Some(CloseReason::TakeProfit));
        assert!(position.exit_time.is_some());
    }

    #[test]
    fn test_cannot_close_twice() {
        let mut position = long_position();
        position.close(2000.0, CloseReason::Manual, Utc::now()).unwrap();

        let result = position.close(2010.0, CloseReason::Manual, Utc::now());
        assert!(result.unwrap_err().to_string().contains("already closed"));
    }

    #[test]
    fn test_status_and_reason_round_trip_strings() {
        assert_eq!(PositionStatus::parse("Open"), Some(PositionStatus::Open));
        assert_eq!(PositionStatus::parse("bogus"), None);
        assert_eq!(
            CloseReason::parse(CloseReason::TrailingStop.as_str()),
            Some(CloseReason::TrailingStop)
        );
    }
}
