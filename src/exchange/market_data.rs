use super::error::{map_api_error, map_transport_error, ApiErrorBody, ErrorKind, ExchangeError};
use super::{millis_to_utc, parse_decimal_str};
use crate::models::PriceBar;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const RATE_LIMIT_RPM: u32 = 600; // Well under the public REST weight budget
const MAX_KLINE_LIMIT: usize = 1500;

// Type alias for the rate limiter to simplify signatures
type RestRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

/// Public (unsigned) REST market data: server clock and kline history
///
/// Cloneable; clones share the HTTP connection pool and the rate limiter.
#[derive(Clone)]
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<RestRateLimiter>,
}

impl MarketDataClient {
    /// # Arguments
    /// * `base_url` - REST root (e.g., "https://fapi.binance.com")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap_or(NonZeroU32::MIN));

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Rate-limited GET, decoding either the payload or the API error body
    async fn get<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| map_transport_error(operation, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<ApiErrorBody>(&text).ok();
            return Err(map_api_error(
                operation,
                Some(status.as_u16()),
                body.as_ref(),
                ErrorKind::Unknown,
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| map_transport_error(operation, &e))
    }

    /// Current exchange time
    pub async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        let response: ServerTimeResponse = self.get("server_time", "/fapi/v1/time", &[]).await?;
        millis_to_utc("server_time", response.server_time)
    }

    /// Fetch the most recent `limit` klines, oldest first.
    ///
    /// The last kline is usually still in progress; it is returned with
    /// `is_final = false`.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>, ExchangeError> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        let rows: Vec<Vec<serde_json::Value>> = self
            .get(
                "fetch_price_bars",
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let now = Utc::now();
        let bars = rows
            .iter()
            .map(|row| parse_kline_row(symbol, interval, row, now))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Fetched {} klines for {} {}", bars.len(), symbol, interval);

        Ok(bars)
    }
}

/// Parse one REST kline row:
/// `[open_time, "open", "high", "low", "close", "volume", close_time, ...]`
fn parse_kline_row(
    symbol: &str,
    interval: &str,
    row: &[serde_json::Value],
    now: DateTime<Utc>,
) -> Result<PriceBar, ExchangeError> {
    const OPERATION: &str = "fetch_price_bars";

    let malformed = || {
        ExchangeError::new(
            ErrorKind::InvalidRequest,
            OPERATION,
            format!("malformed kline row: {:?}", row),
        )
    };

    let millis = |idx: usize| row.get(idx).and_then(|v| v.as_i64()).ok_or_else(malformed);
    let number = |idx: usize, field: &str| -> Result<f64, ExchangeError> {
        let raw = row.get(idx).and_then(|v| v.as_str()).ok_or_else(malformed)?;
        parse_decimal_str(OPERATION, field, raw)
    };

    let close_time = millis_to_utc(OPERATION, millis(6)?)?;

    Ok(PriceBar {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time: millis_to_utc(OPERATION, millis(0)?)?,
        close_time,
        open: number(1, "open")?,
        high: number(2, "high")?,
        low: number(3, "low")?,
        close: number(4, "close")?,
        volume: number(5, "volume")?,
        is_final: close_time <= now,
    })
}
