use super::price_history::{PriceHistory, PushOutcome, DEFAULT_HISTORY_CAPACITY};
use crate::db::{PositionStore, StoreError};
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::models::{CloseReason, OrderAck, Position, PositionRisk, PriceBar, Side};
use crate::risk::{protective_levels, TradeBlock, TradeLimits, TradingState};
use crate::strategy::SignalSource;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Static parameters of one trading engine (one symbol, one interval)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbol: String,
    pub interval: String,
    /// Side of entry orders
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Decimal places protective trigger prices are rounded to
    pub price_precision: u32,
    pub history_capacity: usize,
    pub limits: TradeLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "ETHUSDT".to_string(),
            interval: "15m".to_string(),
            side: Side::Buy,
            quantity: 0.1,
            leverage: 5,
            stop_loss_pct: 0.02,   // -2% from fill
            take_profit_pct: 0.05, // +5% from fill
            price_precision: 2,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            limits: TradeLimits::default(),
        }
    }
}

/// Position lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Entering,
    Open,
    /// Exit in flight, or exit done on the exchange but not yet persisted
    Closing,
}

/// What a bar did to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    /// In-progress bar, kept for display only
    Cached,
    /// Finalized bar older than the newest cached one
    Stale,
    /// Finalized bar already decided on (stream replay); cache refreshed only
    Replayed,
    WarmingUp { have: usize, need: usize },
    /// No action taken
    Held,
    Blocked(TradeBlock),
    Entered(Position),
    Closed(Position),
    /// A previously failed close record was finally persisted
    CloseSynced(Position),
}

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("entry order failed: {0}")]
    EntryOrder(#[source] ExchangeError),

    #[error("stop-loss order failed after entry fill (emergency close sent: {emergency_closed}): {source}")]
    StopLossOrder {
        source: ExchangeError,
        emergency_closed: bool,
    },

    #[error("take-profit order failed after entry fill (emergency close sent: {emergency_closed}): {source}")]
    TakeProfitOrder {
        source: ExchangeError,
        emergency_closed: bool,
    },

    #[error("persisting new position failed (emergency close sent: {emergency_closed}): {source}")]
    PersistEntry {
        source: StoreError,
        emergency_closed: bool,
    },

    #[error("exit order failed, position left open: {0}")]
    ExitOrder(#[source] ExchangeError),

    #[error("persisting closed position failed: {0}")]
    PersistClose(#[source] StoreError),

    #[error("invalid engine state: {0}")]
    State(String),
}

/// Single owner of the trading state.
///
/// Bars are handled strictly one at a time through `&mut self`; a saga
/// started by a bar always finishes before the next bar is looked at.
pub struct Orchestrator {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeGateway>,
    store: Arc<dyn PositionStore>,
    signals: Box<dyn SignalSource>,
    history: PriceHistory,
    live_bar: Option<PriceBar>,
    position: Option<Position>,
    unsynced_close: Option<Position>,
    exchange_risk: Option<PositionRisk>,
    state: TradingState,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeGateway>,
        store: Arc<dyn PositionStore>,
        signals: Box<dyn SignalSource>,
    ) -> Self {
        let history = PriceHistory::new(config.history_capacity);

        Self {
            config,
            exchange,
            store,
            signals,
            history,
            live_bar: None,
            position: None,
            unsynced_close: None,
            exchange_risk: None,
            state: TradingState::new(Utc::now().date_naive(), 0),
            phase: Phase::Idle,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn trades_today(&self) -> u32 {
        self.state.daily_trades
    }

    pub fn history(&self) -> &PriceHistory {
        &self.history
    }

    /// Latest in-progress bar, if one arrived after the last finalized bar
    pub fn live_bar(&self) -> Option<&PriceBar> {
        self.live_bar.as_ref()
    }

    pub fn has_unsynced_close(&self) -> bool {
        self.unsynced_close.is_some()
    }

    /// Whether a new entry would be allowed right now
    pub fn can_trade(&self) -> bool {
        self.config
            .limits
            .check(self.position.is_some(), &self.state)
            .is_ok()
    }

    /// Make the exchange use the configured leverage for the symbol
    pub async fn sync_leverage(&mut self) -> Result<(), ExchangeError> {
        let symbol = &self.config.symbol;
        let risk = self.exchange.get_position_risk(symbol).await?;

        match &risk {
            Some(r) if r.leverage == self.config.leverage => {
                tracing::debug!(symbol = %symbol, "Leverage already {}x", r.leverage);
            }
            _ => {
                self.exchange
                    .set_leverage(symbol, self.config.leverage)
                    .await?;
                tracing::info!(symbol = %symbol, "Leverage set to {}x", self.config.leverage);
            }
        }

        self.exchange_risk = risk;
        Ok(())
    }

    /// Load the open position and today's trade count from the store
    pub async fn restore(&mut self) -> Result<(), StoreError> {
        self.restore_at(Utc::now().date_naive()).await
    }

    pub async fn restore_at(&mut self, today: NaiveDate) -> Result<(), StoreError> {
        let symbol = self.config.symbol.clone();

        let open = self.store.find_open(&symbol).await?;
        let closed_today = self.store.count_closed_on(&symbol, today).await?;

        self.state = TradingState::new(today, closed_today);

        let exchange_amt = self
            .exchange_risk
            .as_ref()
            .map(|r| r.position_amt)
            .unwrap_or(0.0);
        match (&open, exchange_amt != 0.0) {
            (Some(p), false) => tracing::warn!(
                symbol = %symbol,
                "Store has an open {} position ({:.4} @ {:.4}) but the exchange reports none",
                p.side,
                p.quantity,
                p.entry_price
            ),
            (None, true) => tracing::warn!(
                symbol = %symbol,
                "Exchange reports a position of {:.4} that is not in the store",
                exchange_amt
            ),
            _ => {}
        }

        match &open {
            Some(p) => tracing::info!(
                symbol = %symbol,
                "Restored open {} position: {:.4} @ {:.4} (SL {:.4}, TP {:.4})",
                p.side,
                p.quantity,
                p.entry_price,
                p.stop_loss,
                p.take_profit
            ),
            None => tracing::info!(symbol = %symbol, "No open position to restore"),
        }
        tracing::info!(symbol = %symbol, "Trades closed today: {}", closed_today);

        self.phase = if open.is_some() { Phase::Open } else { Phase::Idle };
        self.position = open;
        Ok(())
    }

    /// Seed the history cache. Returns the number of finalized bars cached.
    pub fn warm_up(&mut self, bars: Vec<PriceBar>) -> usize {
        for bar in bars {
            if bar.is_final {
                self.history.push(bar);
            } else {
                self.live_bar = Some(bar);
            }
        }

        tracing::info!(
            symbol = %self.config.symbol,
            "History warmed up with {} bars (strategy needs {})",
            self.history.len(),
            self.signals.required_history_length()
        );

        self.history.len()
    }

    /// Fetch recent bars from the exchange and seed the history cache
    pub async fn load_history(&mut self) -> Result<usize, ExchangeError> {
        let bars = self
            .exchange
            .fetch_price_bars(
                &self.config.symbol,
                &self.config.interval,
                self.history.capacity(),
            )
            .await?;
        Ok(self.warm_up(bars))
    }

    /// Process one stream event
    pub async fn on_bar(&mut self, bar: PriceBar) -> Result<BarOutcome, SagaError> {
        if !bar.is_final {
            self.live_bar = Some(bar);
            return Ok(BarOutcome::Cached);
        }

        let day = bar.close_time.date_naive();
        if self.state.roll_day(day) {
            tracing::info!(symbol = %self.config.symbol, "New trading day {}, daily trade counter reset", day);
        }

        let price = bar.close;
        match self.history.push(bar) {
            PushOutcome::Appended => {}
            PushOutcome::Replaced => return Ok(BarOutcome::Replayed),
            PushOutcome::Stale => return Ok(BarOutcome::Stale),
        }
        self.live_bar = None;

        if self.unsynced_close.is_some() {
            return self.retry_close_sync().await;
        }

        let need = self.signals.required_history_length();
        if self.history.len() < need {
            return Ok(BarOutcome::WarmingUp {
                have: self.history.len(),
                need,
            });
        }

        if let Some(position) = self.position.as_mut() {
            let reason = self
                .signals
                .should_close(position, self.history.as_slice(), price);

            return match reason {
                Some(reason) => self.run_exit(reason, price).await.map(BarOutcome::Closed),
                None => Ok(BarOutcome::Held),
            };
        }

        if let Err(block) = self.config.limits.check(false, &self.state) {
            return Ok(BarOutcome::Blocked(block));
        }

        if self.signals.should_enter(self.history.as_slice(), price) {
            self.run_entry(price).await.map(BarOutcome::Entered)
        } else {
            Ok(BarOutcome::Held)
        }
    }

    /// Consume bars until the channel closes or `cancel` fires
    pub async fn run(
        mut self,
        mut bars: mpsc::Receiver<PriceBar>,
        cancel: CancellationToken,
    ) -> Self {
        tracing::info!(
            symbol = %self.config.symbol,
            interval = %self.config.interval,
            strategy = %self.signals.name(),
            "Orchestrator started"
        );

        loop {
            let bar = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                bar = bars.recv() => match bar {
                    Some(bar) => bar,
                    None => break,
                },
            };

            match self.on_bar(bar).await {
                Ok(BarOutcome::Entered(p)) => tracing::info!(
                    symbol = %p.symbol,
                    "Entered {} {:.4} @ {:.4} (trades today: {})",
                    p.side,
                    p.quantity,
                    p.entry_price,
                    self.state.daily_trades
                ),
                Ok(BarOutcome::Closed(p)) | Ok(BarOutcome::CloseSynced(p)) => tracing::info!(
                    symbol = %p.symbol,
                    "Closed position @ {:.4}, P&L {:.4}",
                    p.exit_price.unwrap_or_default(),
                    p.realized_pnl.unwrap_or_default()
                ),
                Ok(outcome) => tracing::debug!(?outcome, "Bar processed"),
                Err(e) => tracing::error!(symbol = %self.config.symbol, "Saga failed: {}", e),
            }
        }

        tracing::info!(symbol = %self.config.symbol, "Orchestrator stopped");
        self
    }

    async fn run_entry(&mut self, bar_close: f64) -> Result<Position, SagaError> {
        self.phase = Phase::Entering;

        match self.enter(bar_close).await {
            Ok(position) => {
                self.position = Some(position.clone());
                self.state.record_entry();
                self.phase = Phase::Open;
                Ok(position)
            }
            Err(e) => {
                self.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    async fn enter(&self, bar_close: f64) -> Result<Position, SagaError> {
        let symbol = self.config.symbol.as_str();
        let side = self.config.side;
        let exit_side = side.opposite();

        let ack = self
            .exchange
            .place_market_order(symbol, side, self.config.quantity)
            .await
            .map_err(|e| {
                tracing::error!(symbol = %symbol, "Entry order failed: {}", e);
                SagaError::EntryOrder(e)
            })?;

        let fill = fill_price(&ack, bar_close);
        let quantity = if ack.filled_qty > 0.0 {
            ack.filled_qty
        } else {
            self.config.quantity
        };

        let levels = protective_levels(
            fill,
            side,
            self.config.stop_loss_pct,
            self.config.take_profit_pct,
            self.config.price_precision,
        );

        let stop = match self
            .exchange
            .place_stop_market_order(symbol, exit_side, quantity, levels.stop_loss)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "Stop-loss order at {:.4} failed after entry fill, closing position: {}",
                    levels.stop_loss,
                    e
                );
                let emergency_closed = self.emergency_close(exit_side, quantity).await;
                return Err(SagaError::StopLossOrder {
                    source: e,
                    emergency_closed,
                });
            }
        };

        let target = match self
            .exchange
            .place_take_profit_market_order(symbol, exit_side, quantity, levels.take_profit)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "Take-profit order at {:.4} failed after entry fill, closing position: {}",
                    levels.take_profit,
                    e
                );
                self.cancel_protective(&stop.order_id).await;
                let emergency_closed = self.emergency_close(exit_side, quantity).await;
                return Err(SagaError::TakeProfitOrder {
                    source: e,
                    emergency_closed,
                });
            }
        };

        let mut position = Position::open(
            symbol,
            side,
            fill,
            quantity,
            self.config.leverage,
            levels.stop_loss,
            levels.take_profit,
            Utc::now(),
        );
        position.stop_loss_order_id = Some(stop.order_id.clone());
        position.take_profit_order_id = Some(target.order_id.clone());

        match self.store.create(&position).await {
            Ok(id) => position.id = Some(id),
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "Persisting new position failed, unwinding entry: {}",
                    e
                );
                self.cancel_protective(&stop.order_id).await;
                self.cancel_protective(&target.order_id).await;
                let emergency_closed = self.emergency_close(exit_side, quantity).await;
                return Err(SagaError::PersistEntry {
                    source: e,
                    emergency_closed,
                });
            }
        }

        tracing::info!(
            symbol = %symbol,
            stop_loss_order_id = %stop.order_id,
            take_profit_order_id = %target.order_id,
            "Opened {} position {:.4} @ {:.4} (SL {:.4}, TP {:.4})",
            side,
            quantity,
            fill,
            levels.stop_loss,
            levels.take_profit
        );

        Ok(position)
    }

    async fn run_exit(&mut self, reason: CloseReason, bar_close: f64) -> Result<Position, SagaError> {
        let position = self
            .position
            .clone()
            .ok_or_else(|| SagaError::State("exit requested without an open position".to_string()))?;
        let symbol = position.symbol.clone();

        self.phase = Phase::Closing;

        let ack = match self
            .exchange
            .place_market_order(&symbol, position.side.opposite(), position.quantity)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "Exit order ({}) failed, position stays open: {}",
                    reason,
                    e
                );
                self.phase = Phase::Open;
                return Err(SagaError::ExitOrder(e));
            }
        };

        let fill = fill_price(&ack, bar_close);

        for order_id in [&position.stop_loss_order_id, &position.take_profit_order_id]
            .into_iter()
            .flatten()
        {
            self.cancel_protective(order_id).await;
        }

        let mut closed = position;
        closed
            .close(fill, reason, Utc::now())
            .map_err(|e| SagaError::State(e.to_string()))?;

        match self.store.update(&closed).await {
            Ok(()) => {
                tracing::info!(
                    symbol = %symbol,
                    "Closed {} position @ {:.4} ({}), P&L {:.4}",
                    closed.side,
                    fill,
                    reason,
                    closed.realized_pnl.unwrap_or_default()
                );
                self.position = None;
                self.phase = Phase::Idle;
                Ok(closed)
            }
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "CRITICAL: position is flat on the exchange but the close was not persisted; retrying on next bar: {}",
                    e
                );
                self.unsynced_close = Some(closed);
                Err(SagaError::PersistClose(e))
            }
        }
    }

    /// Retry only the store write of a close whose exchange side already happened
    async fn retry_close_sync(&mut self) -> Result<BarOutcome, SagaError> {
        let Some(closed) = self.unsynced_close.clone() else {
            return Ok(BarOutcome::Held);
        };

        match self.store.update(&closed).await {
            Ok(()) => {
                tracing::info!(symbol = %closed.symbol, "Pending close persisted");
                self.unsynced_close = None;
                self.position = None;
                self.phase = Phase::Idle;
                Ok(BarOutcome::CloseSynced(closed))
            }
            // Only the exit saga closes records, so a Closed row means an
            // earlier write committed after reporting failure
            Err(StoreError::AlreadyClosed(id)) => {
                tracing::warn!(
                    symbol = %closed.symbol,
                    "Position {} was already closed in the store; treating pending close as synced",
                    id
                );
                self.unsynced_close = None;
                self.position = None;
                self.phase = Phase::Idle;
                Ok(BarOutcome::CloseSynced(closed))
            }
            Err(e) => {
                tracing::error!(
                    symbol = %closed.symbol,
                    "CRITICAL: close still not persisted, trading paused: {}",
                    e
                );
                Err(SagaError::PersistClose(e))
            }
        }
    }

    /// Cancel a protective order. Already gone (filled, expired or never
    /// accepted) counts as success.
    async fn cancel_protective(&self, order_id: &str) -> bool {
        let symbol = self.config.symbol.as_str();

        match self.exchange.cancel_order(symbol, order_id).await {
            Ok(_) => {
                tracing::debug!(symbol = %symbol, order_id = %order_id, "Protective order cancelled");
                true
            }
            Err(e) if e.is_order_not_found() => {
                tracing::debug!(symbol = %symbol, order_id = %order_id, "Protective order already gone");
                true
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %symbol,
                    order_id = %order_id,
                    "Failed to cancel protective order: {}",
                    e
                );
                false
            }
        }
    }

    /// Best-effort market order that flattens an unprotected fill
    async fn emergency_close(&self, side: Side, quantity: f64) -> bool {
        let symbol = self.config.symbol.as_str();

        match self.exchange.place_market_order(symbol, side, quantity).await {
            Ok(ack) => {
                tracing::warn!(
                    symbol = %symbol,
                    order_id = %ack.order_id,
                    "Emergency close {} {:.4} sent",
                    side,
                    quantity
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    "EMERGENCY CLOSE FAILED for {} {:.4}, manual intervention required: {}",
                    side,
                    quantity,
                    e
                );
                false
            }
        }
    }
}

/// Reported fill price, or `fallback` when the exchange did not report one
fn fill_price(ack: &OrderAck, fallback: f64) -> f64 {
    if ack.avg_price > 0.0 {
        ack.avg_price
    } else {
        tracing::warn!(order_id = %ack.order_id, "No fill price reported, using {:.4}", fallback);
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(avg_price: f64) -> OrderAck {
        OrderAck {
            order_id: "1".to_string(),
            avg_price,
            filled_qty: 1.0,
            status: "FILLED".to_string(),
            side: Side::Buy,
        }
    }

    #[test]
    fn test_fill_price_fallback() {
        assert_eq!(fill_price(&ack(2005.0), 2000.0), 2005.0);
        assert_eq!(fill_price(&ack(0.0), 2000.0), 2000.0);
    }

    #[test]
    fn test_saga_error_messages() {
        let err = SagaError::StopLossOrder {
            source: ExchangeError::new(
                crate::exchange::ErrorKind::OrderPlacementFailed,
                "place_stop_market_order",
                "rejected",
            ),
            emergency_closed: true,
        };
        let msg = err.to_string();
        assert!(msg.contains("stop-loss"));
        assert!(msg.contains("emergency close sent: true"));
    }
}
