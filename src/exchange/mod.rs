// Exchange gateway: order intents, market data and the reconnecting price stream
pub mod error;
pub mod kline_stream;
pub mod market_data;
pub mod paper;
pub mod reconnect;

pub use error::{ErrorKind, ExchangeError};
pub use kline_stream::KlineConnector;
pub use market_data::MarketDataClient;
pub use paper::PaperExchange;
pub use reconnect::{
    BarConnector, ErrorHandler, ReconnectConfig, ReconnectingStream, StreamExit, StreamHandle,
    StreamState,
};

use crate::models::{OrderAck, PositionRisk, PriceBar, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything the engine needs from a derivatives exchange.
///
/// Implementations translate provider failures into [`ExchangeError`] before
/// returning, so callers only ever branch on [`ErrorKind`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Exchange clock, used to detect local drift at startup
    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;

    /// Most recent `limit` bars, oldest first
    async fn fetch_price_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Stop-market order that closes the whole position when triggered
    async fn place_stop_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Take-profit-market order that closes the whole position when triggered
    async fn place_take_profit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError>;

    /// `None` when the exchange knows nothing about the symbol
    async fn get_position_risk(&self, symbol: &str) -> Result<Option<PositionRisk>, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Start the reconnecting bar stream. Bars (final and in-progress) are pushed
    /// into `bars` in arrival order; `on_error` sees every connection failure.
    fn stream_price_bars(
        &self,
        symbol: &str,
        interval: &str,
        bars: mpsc::Sender<PriceBar>,
        on_error: ErrorHandler,
        cancel: CancellationToken,
    ) -> Result<StreamHandle, ExchangeError>;
}

pub(crate) fn millis_to_utc(operation: &str, millis: i64) -> Result<DateTime<Utc>, ExchangeError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        ExchangeError::new(
            ErrorKind::InvalidRequest,
            operation,
            format!("timestamp out of range: {}", millis),
        )
    })
}

pub(crate) fn parse_decimal_str(operation: &str, field: &str, value: &str) -> Result<f64, ExchangeError> {
    value.parse::<f64>().map_err(|_| {
        ExchangeError::new(
            ErrorKind::InvalidRequest,
            operation,
            format!("invalid {} value: {:?}", field, value),
        )
    })
}
