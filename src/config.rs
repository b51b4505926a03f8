use crate::exchange::ReconnectConfig;
use crate::execution::{EngineConfig, DEFAULT_HISTORY_CAPACITY};
use crate::models::Side;
use crate::risk::TradeLimits;
use crate::strategy::SmaCrossConfig;
use crate::Result;
use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Environment variables override file values: `PERPBOT__TRADING__SYMBOL=BTCUSDT`
pub const ENV_PREFIX: &str = "PERPBOT";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub stream: StreamSettings,
    pub trading: TradingSettings,
    pub strategy: SmaCrossConfig,
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub ws_url: String,
    pub request_timeout_secs: u64,
    /// Local clock drift tolerated at startup before warning
    pub max_clock_drift_ms: i64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            request_timeout_secs: 10,
            max_clock_drift_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
    /// Bars buffered between the stream and the orchestrator
    pub channel_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_reconnect_attempts: 10,
            connect_timeout_secs: 10,
            channel_capacity: 256,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub price_precision: u32,
    pub history_capacity: usize,
    pub max_daily_trades: u32,
}

impl Default for TradingSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            symbol: engine.symbol,
            interval: engine.interval,
            side: engine.side,
            quantity: engine.quantity,
            leverage: engine.leverage,
            stop_loss_pct: engine.stop_loss_pct,
            take_profit_pct: engine.take_profit_pct,
            price_precision: engine.price_precision,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_daily_trades: engine.limits.max_daily_trades,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Falls back to `DATABASE_URL` when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl DatabaseSettings {
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

impl Settings {
    /// Load `path` (any format the `config` crate detects from the extension,
    /// optional) layered under `PERPBOT__*` environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;

        if t.symbol.trim().is_empty() {
            return Err("trading.symbol must not be empty".into());
        }
        if t.interval.trim().is_empty() {
            return Err("trading.interval must not be empty".into());
        }
        if !(t.quantity.is_finite() && t.quantity > 0.0) {
            return Err(format!("trading.quantity must be positive, got {}", t.quantity).into());
        }
        if t.leverage == 0 {
            return Err("trading.leverage must be at least 1".into());
        }
        for (name, pct) in [
            ("trading.stop_loss_pct", t.stop_loss_pct),
            ("trading.take_profit_pct", t.take_profit_pct),
        ] {
            if !(pct > 0.0 && pct < 1.0) {
                return Err(format!("{} must be in (0, 1), got {}", name, pct).into());
            }
        }
        if t.history_capacity == 0 {
            return Err("trading.history_capacity must be at least 1".into());
        }
        if self.strategy.fast_period == 0 || self.strategy.slow_period == 0 {
            return Err("strategy periods must be at least 1".into());
        }
        if self.strategy.slow_period.max(self.strategy.fast_period) + 1 > t.history_capacity {
            return Err("trading.history_capacity is smaller than the strategy lookback".into());
        }
        if self.stream.max_reconnect_attempts == 0 {
            return Err("stream.max_reconnect_attempts must be at least 1".into());
        }
        if self.stream.channel_capacity == 0 {
            return Err("stream.channel_capacity must be at least 1".into());
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let t = &self.trading;
        EngineConfig {
            symbol: t.symbol.to_uppercase(),
            interval: t.interval.clone(),
            side: t.side,
            quantity: t.quantity,
            leverage: t.leverage,
            stop_loss_pct: t.stop_loss_pct,
            take_profit_pct: t.take_profit_pct,
            price_precision: t.price_precision,
            history_capacity: t.history_capacity,
            limits: TradeLimits {
                max_daily_trades: t.max_daily_trades,
            },
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.stream.base_delay_ms),
            max_reconnect_attempts: self.stream.max_reconnect_attempts,
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_secs),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.stream.shutdown_grace_secs)
    }
}
