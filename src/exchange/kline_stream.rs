use super::error::{map_ws_error, ErrorKind, ExchangeError};
use super::reconnect::{BarConnector, BarStream};
use super::{millis_to_utc, parse_decimal_str};
use crate::models::PriceBar;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const OPERATION: &str = "stream_receive";

/// Kline event pushed by the exchange websocket
#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: Option<String>,
    #[serde(rename = "k")]
    kline: Option<KlinePayload>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

/// Parse one websocket text frame.
///
/// Returns `Ok(None)` for frames that are not kline events (subscription
/// acks and the like).
pub fn parse_kline_event(text: &str) -> Result<Option<PriceBar>, ExchangeError> {
    let event: KlineEvent = serde_json::from_str(text).map_err(|e| {
        ExchangeError::new(
            ErrorKind::InvalidRequest,
            OPERATION,
            format!("malformed stream frame: {}", e),
        )
    })?;

    let kline = match (event.event_type.as_deref(), event.kline) {
        (Some("kline"), Some(kline)) => kline,
        _ => return Ok(None),
    };

    Ok(Some(PriceBar {
        symbol: kline.symbol,
        interval: kline.interval,
        open_time: millis_to_utc(OPERATION, kline.open_time)?,
        close_time: millis_to_utc(OPERATION, kline.close_time)?,
        open: parse_decimal_str(OPERATION, "open", &kline.open)?,
        high: parse_decimal_str(OPERATION, "high", &kline.high)?,
        low: parse_decimal_str(OPERATION, "low", &kline.low)?,
        close: parse_decimal_str(OPERATION, "close", &kline.close)?,
        volume: parse_decimal_str(OPERATION, "volume", &kline.volume)?,
        is_final: kline.is_final,
    }))
}

/// Websocket kline subscription, one connection per symbol/interval
#[derive(Debug, Clone)]
pub struct KlineConnector {
    ws_url: String,
}

impl KlineConnector {
    /// # Arguments
    /// * `ws_url` - Base stream URL (e.g., "wss://fstream.binance.com/ws")
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn stream_url(&self, symbol: &str, interval: &str) -> String {
        format!(
            "{}/{}@kline_{}",
            self.ws_url.trim_end_matches('/'),
            symbol.to_lowercase(),
            interval
        )
    }
}

#[async_trait]
impl BarConnector for KlineConnector {
    async fn connect(&self, symbol: &str, interval: &str) -> Result<BarStream, ExchangeError> {
        let url = self.stream_url(symbol, interval);
        tracing::debug!("Connecting to {}", url);

        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| map_ws_error("stream_connect", &e))?;

        // Pings are answered by tungstenite while the stream is being read
        let bars = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => parse_kline_event(&text).transpose(),
                Ok(Message::Close(frame)) => Some(Err(ExchangeError::new(
                    ErrorKind::ConnectionFailed,
                    OPERATION,
                    format!("closed by server: {:?}", frame),
                ))),
                Ok(_) => None,
                Err(e) => Some(Err(map_ws_error(OPERATION, &e))),
            }
        });

        Ok(bars.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "e": "kline", "E": 1700000060123, "s": "ETHUSDT",
        "k": {
            "t": 1700000000000, "T": 1700000059999, "s": "ETHUSDT", "i": "1m",
            "f": 100, "L": 200, "o": "2001.50", "c": "2005.00", "h": "2006.25",
            "l": "2000.75", "v": "1234.5", "n": 100, "x": true, "q": "0", "V": "0",
            "Q": "0", "B": "0"
        }
    }"#;

    #[test]
    fn test_parse_final_kline() {
        let bar = parse_kline_event(FRAME).unwrap().unwrap();

        assert_eq!(bar.symbol, "ETHUSDT");
        assert_eq!(bar.interval, "1m");
        assert_eq!(bar.open, 2001.5);
        assert_eq!(bar.close, 2005.0);
        assert_eq!(bar.high, 2006.25);
        assert_eq!(bar.low, 2000.75);
        assert_eq!(bar.volume, 1234.5);
        assert!(bar.is_final);
        assert_eq!(bar.open_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(bar.close_time.timestamp_millis(), 1_700_000_059_999);
    }

    #[test]
    fn test_in_progress_kline() {
        let frame = FRAME.replace(r#""x": true"#, r#""x": false"#);
        let bar = parse_kline_event(&frame).unwrap().unwrap();
        assert!(!bar.is_final);
    }

    #[test]
    fn test_non_kline_frame_ignored() {
        let ack = r#"{"result": null, "id": 1}"#;
        assert!(parse_kline_event(ack).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_invalid_request() {
        let err = parse_kline_event("not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let bad_price = FRAME.replace("2005.00", "abc");
        let err = parse_kline_event(&bad_price).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("close"));
    }

    #[test]
    fn test_stream_url() {
        let connector = KlineConnector::new("wss://fstream.binance.com/ws/");
        assert_eq!(
            connector.stream_url("ETHUSDT", "15m"),
            "wss://fstream.binance.com/ws/ethusdt@kline_15m"
        );
    }
}
