use super::error::{map_api_error, ApiErrorBody, ErrorKind, ExchangeError};
use super::kline_stream::KlineConnector;
use super::market_data::MarketDataClient;
use super::reconnect::{
    BarConnector, BarStream, ErrorHandler, ReconnectConfig, ReconnectingStream, StreamHandle,
};
use super::ExchangeGateway;
use crate::models::{OrderAck, PositionRisk, PriceBar, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_LEVERAGE: u32 = 20;
const MAX_LEVERAGE: u32 = 125;

/// Protective order waiting for cancellation. Triggering is not simulated.
#[derive(Debug, Clone)]
struct RestingOrder {
    symbol: String,
    side: Side,
}

#[derive(Debug, Clone, Default)]
struct NetPosition {
    amount: f64, // Signed: positive long, negative short
    entry_price: f64,
}

#[derive(Debug, Default)]
struct PaperBook {
    next_order_id: u64,
    resting: HashMap<String, RestingOrder>,
    positions: HashMap<String, NetPosition>,
    leverage: HashMap<String, u32>,
    last_price: HashMap<String, f64>,
}

impl PaperBook {
    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("paper-{}", self.next_order_id)
    }

    fn apply_fill(&mut self, symbol: &str, side: Side, quantity: f64, price: f64) {
        let signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let position = self.positions.entry(symbol.to_string()).or_default();
        let new_amount = position.amount + signed;

        if position.amount == 0.0 || position.amount.signum() == signed.signum() {
            // Opening or adding: weighted average entry
            let total = position.amount.abs() + quantity;
            if total > 0.0 {
                position.entry_price =
                    (position.entry_price * position.amount.abs() + price * quantity) / total;
            }
        } else if new_amount != 0.0 && new_amount.signum() != position.amount.signum() {
            // Flipped through zero: remainder opened at this price
            position.entry_price = price;
        }

        position.amount = new_amount;
        if position.amount.abs() < f64::EPSILON {
            self.positions.remove(symbol);
        }
    }
}

/// Paper-trading gateway.
///
/// Orders are simulated in memory: market orders fill at the last price seen
/// on the stream (or report a zero fill price when none is known yet), and
/// protective orders rest until cancelled. Market data is real.
pub struct PaperExchange {
    market: MarketDataClient,
    ws_url: String,
    reconnect: ReconnectConfig,
    book: Arc<Mutex<PaperBook>>,
}

impl PaperExchange {
    pub fn new(market: MarketDataClient, ws_url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            market,
            ws_url: ws_url.into(),
            reconnect,
            book: Arc::new(Mutex::new(PaperBook::default())),
        }
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        // A poisoned book only means another task panicked mid-update; the data is still usable
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the latest traded price for `symbol`
    pub fn record_price(&self, symbol: &str, price: f64) {
        self.book().last_price.insert(symbol.to_string(), price);
    }

    /// Number of resting protective orders for `symbol`
    pub fn resting_orders(&self, symbol: &str) -> usize {
        self.book()
            .resting
            .values()
            .filter(|o| o.symbol == symbol)
            .count()
    }

    fn place_resting(
        &self,
        operation: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        validate_quantity(operation, quantity)?;
        if !(stop_price.is_finite() && stop_price > 0.0) {
            return Err(ExchangeError::new(
                ErrorKind::InvalidRequest,
                operation,
                format!("invalid stop price {}", stop_price),
            ));
        }

        let mut book = self.book();
        let order_id = book.next_id();
        book.resting.insert(
            order_id.clone(),
            RestingOrder {
                symbol: symbol.to_string(),
                side,
            },
        );

        tracing::debug!(
            symbol = %symbol,
            order_id = %order_id,
            "Paper {} {} @ {:.4} resting",
            operation,
            side,
            stop_price
        );

        Ok(OrderAck {
            order_id,
            avg_price: 0.0,
            filled_qty: 0.0,
            status: "NEW".to_string(),
            side,
        })
    }
}

fn validate_quantity(operation: &str, quantity: f64) -> Result<(), ExchangeError> {
    if quantity.is_finite() && quantity > 0.0 {
        Ok(())
    } else {
        Err(ExchangeError::new(
            ErrorKind::InvalidRequest,
            operation,
            format!("invalid quantity {}", quantity),
        ))
    }
}

/// Wraps the websocket connector to keep the paper book's last price current
struct PriceTap {
    inner: KlineConnector,
    book: Arc<Mutex<PaperBook>>,
}

#[async_trait]
impl BarConnector for PriceTap {
    async fn connect(&self, symbol: &str, interval: &str) -> Result<BarStream, ExchangeError> {
        let stream = self.inner.connect(symbol, interval).await?;
        let book = self.book.clone();

        Ok(stream
            .inspect(move |item| {
                if let Ok(bar) = item {
                    let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
                    book.last_price.insert(bar.symbol.clone(), bar.close);
                }
            })
            .boxed())
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.market.server_time().await
    }

    async fn fetch_price_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>, ExchangeError> {
        let bars = self.market.klines(symbol, interval, limit).await?;
        if let Some(last) = bars.last() {
            self.record_price(symbol, last.close);
        }
        Ok(bars)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ExchangeError> {
        validate_quantity("place_market_order", quantity)?;

        let mut book = self.book();
        let price = book.last_price.get(symbol).copied().unwrap_or(0.0);
        let order_id = book.next_id();
        book.apply_fill(symbol, side, quantity, price);

        tracing::info!(
            symbol = %symbol,
            order_id = %order_id,
            "Paper market {} {:.4} filled @ {:.4}",
            side,
            quantity,
            price
        );

        Ok(OrderAck {
            order_id,
            avg_price: price,
            filled_qty: quantity,
            status: "FILLED".to_string(),
            side,
        })
    }

    async fn place_stop_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_resting(
            "place_stop_market_order",
            symbol,
            side,
            quantity,
            stop_price,
        )
    }

    async fn place_take_profit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.place_resting(
            "place_take_profit_market_order",
            symbol,
            side,
            quantity,
            stop_price,
        )
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError> {
        let mut book = self.book();
        match book.resting.get(order_id) {
            Some(order) if order.symbol == symbol => {}
            _ => {
                // Same response the live API gives for an unknown order
                let body = ApiErrorBody {
                    code: -2011,
                    msg: "Unknown order sent.".to_string(),
                };
                return Err(map_api_error(
                    "cancel_order",
                    Some(400),
                    Some(&body),
                    ErrorKind::OrderCancelFailed,
                ));
            }
        }

        let order = book.resting.remove(order_id).ok_or_else(|| {
            ExchangeError::new(ErrorKind::OrderCancelFailed, "cancel_order", "order vanished")
        })?;

        tracing::debug!(symbol = %symbol, order_id = %order_id, "Paper order cancelled");

        Ok(OrderAck {
            order_id: order_id.to_string(),
            avg_price: 0.0,
            filled_qty: 0.0,
            status: "CANCELED".to_string(),
            side: order.side,
        })
    }

    async fn get_position_risk(&self, symbol: &str) -> Result<Option<PositionRisk>, ExchangeError> {
        let book = self.book();
        let leverage = book.leverage.get(symbol).copied();
        let position = book.positions.get(symbol).cloned();

        if leverage.is_none() && position.is_none() {
            return Ok(None);
        }

        let position = position.unwrap_or_default();
        let mark = book.last_price.get(symbol).copied().unwrap_or(position.entry_price);

        Ok(Some(PositionRisk {
            symbol: symbol.to_string(),
            position_amt: position.amount,
            entry_price: position.entry_price,
            leverage: leverage.unwrap_or(DEFAULT_LEVERAGE),
            unrealized_pnl: (mark - position.entry_price) * position.amount,
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        if !(1..=MAX_LEVERAGE).contains(&leverage) {
            return Err(ExchangeError::new(
                ErrorKind::InvalidRequest,
                "set_leverage",
                format!("leverage {} outside 1..={}", leverage, MAX_LEVERAGE),
            ));
        }
        self.book().leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    fn stream_price_bars(
        &self,
        symbol: &str,
        interval: &str,
        bars: mpsc::Sender<PriceBar>,
        on_error: ErrorHandler,
        cancel: CancellationToken,
    ) -> Result<StreamHandle, ExchangeError> {
        let connector = PriceTap {
            inner: KlineConnector::new(self.ws_url.clone()),
            book: self.book.clone(),
        };

        Ok(ReconnectingStream::new(Arc::new(connector), self.reconnect.clone())
            .spawn(symbol, interval, bars, on_error, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> PaperExchange {
        PaperExchange::new(
            MarketDataClient::new("http://127.0.0.1:9"),
            "ws://127.0.0.1:9",
            ReconnectConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_market_order_fills_at_last_price() {
        let exchange = paper();
        exchange.record_price("ETHUSDT", 2005.0);

        let ack = exchange
            .place_market_order("ETHUSDT", Side::Buy, 0.5)
            .await
            .unwrap();

        assert_eq!(ack.avg_price, 2005.0);
        assert_eq!(ack.filled_qty, 0.5);
        assert_eq!(ack.status, "FILLED");

        let risk = exchange.get_position_risk("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(risk.position_amt, 0.5);
        assert_eq!(risk.entry_price, 2005.0);
    }

    #[tokio::test]
    async fn test_market_order_without_price_reports_zero_fill() {
        let exchange = paper();
        let ack = exchange
            .place_market_order("ETHUSDT", Side::Sell, 1.0)
            .await
            .unwrap();
        assert_eq!(ack.avg_price, 0.0);
    }

    #[tokio::test]
    async fn test_round_trip_flattens_position() {
        let exchange = paper();
        exchange.record_price("ETHUSDT", 2000.0);
        exchange
            .place_market_order("ETHUSDT", Side::Buy, 1.0)
            .await
            .unwrap();
        exchange
            .place_market_order("ETHUSDT", Side::Sell, 1.0)
            .await
            .unwrap();

        // No leverage set and no position: unknown to the exchange
        assert!(exchange.get_position_risk("ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_not_found() {
        let exchange = paper();
        let err = exchange
            .cancel_order("ETHUSDT", "paper-42")
            .await
            .unwrap_err();
        assert!(err.is_order_not_found());
    }

    #[tokio::test]
    async fn test_protective_orders_rest_until_cancelled() {
        let exchange = paper();
        let stop = exchange
            .place_stop_market_order("ETHUSDT", Side::Sell, 0.5, 1964.9)
            .await
            .unwrap();
        exchange
            .place_take_profit_market_order("ETHUSDT", Side::Sell, 0.5, 2105.25)
            .await
            .unwrap();
        assert_eq!(exchange.resting_orders("ETHUSDT"), 2);

        let ack = exchange.cancel_order("ETHUSDT", &stop.order_id).await.unwrap();
        assert_eq!(ack.status, "CANCELED");
        assert_eq!(exchange.resting_orders("ETHUSDT"), 1);

        // Second cancel of the same order
        let err = exchange
            .cancel_order("ETHUSDT", &stop.order_id)
            .await
            .unwrap_err();
        assert!(err.is_order_not_found());
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let exchange = paper();
        let err = exchange
            .place_market_order("ETHUSDT", Side::Buy, 0.0)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let err = exchange
            .place_stop_market_order("ETHUSDT", Side::Sell, 1.0, -1.0)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let err = exchange.set_leverage("ETHUSDT", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_leverage_reported_when_flat() {
        let exchange = paper();
        exchange.set_leverage("ETHUSDT", 5).await.unwrap();

        let risk = exchange.get_position_risk("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(risk.leverage, 5);
        assert_eq!(risk.position_amt, 0.0);
    }
}
