use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use perpbot::exchange::reconnect::{BarStream, FixedJitter};
use perpbot::exchange::{
    BarConnector, ErrorHandler, ErrorKind, ExchangeError, ReconnectConfig, ReconnectingStream,
    StreamExit, StreamState,
};
use perpbot::PriceBar;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the fake exchange does on one connect call
enum Session {
    Refuse,
    /// Deliver the bars, then drop the connection
    Deliver(Vec<PriceBar>),
    /// Deliver the bars, then stay connected forever
    DeliverThenIdle(Vec<PriceBar>),
    /// Take this long to answer, then refuse
    Slow(Duration),
}

struct FakeConnector {
    sessions: Mutex<VecDeque<Session>>,
    connects: AtomicU32,
}

impl FakeConnector {
    fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            connects: AtomicU32::new(0),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarConnector for FakeConnector {
    async fn connect(&self, _symbol: &str, _interval: &str) -> Result<BarStream, ExchangeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Session::Refuse);

        match session {
            Session::Refuse => Err(ExchangeError::new(
                ErrorKind::ConnectionFailed,
                "stream_connect",
                "connection refused",
            )),
            Session::Deliver(bars) => Ok(stream::iter(bars.into_iter().map(Ok)).boxed()),
            Session::DeliverThenIdle(bars) => Ok(stream::iter(bars.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Session::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Err(ExchangeError::new(
                    ErrorKind::ConnectionFailed,
                    "stream_connect",
                    "too late",
                ))
            }
        }
    }
}

fn config(max_reconnect_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(5),
        max_reconnect_attempts,
        connect_timeout: Duration::from_secs(2),
    }
}

fn bar(minute: i64, close: f64) -> PriceBar {
    let open_time = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(minute);
    PriceBar {
        symbol: "ETHUSDT".to_string(),
        interval: "1m".to_string(),
        open_time,
        close_time: open_time + ChronoDuration::seconds(59),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        is_final: true,
    }
}

/// Error handler that records the kind of every failure it sees
fn recording_handler() -> (ErrorHandler, Arc<Mutex<Vec<ErrorKind>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: ErrorHandler = Arc::new(move |e: &ExchangeError| {
        sink.lock().unwrap().push(e.kind);
    });
    (handler, seen)
}

fn spawn(
    connector: Arc<FakeConnector>,
    cfg: ReconnectConfig,
    bars: mpsc::Sender<PriceBar>,
    on_error: ErrorHandler,
    cancel: CancellationToken,
) -> perpbot::exchange::StreamHandle {
    ReconnectingStream::new(connector, cfg)
        .with_jitter(Box::new(FixedJitter(0.0)))
        .spawn("ETHUSDT", "1m", bars, on_error, cancel)
}

#[tokio::test]
async fn test_gives_up_after_exactly_max_attempts() {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = FakeConnector::new(vec![]);
    let (tx, _rx) = mpsc::channel(8);
    let (on_error, seen) = recording_handler();

    let mut handle = spawn(connector.clone(), config(4), tx, on_error, CancellationToken::new());

    let exit = tokio::time::timeout(Duration::from_secs(5), handle.done())
        .await
        .expect("stream should give up");

    assert_eq!(exit, StreamExit::Exhausted { attempts: 4 });
    assert_eq!(connector.connects(), 4);
    assert_eq!(seen.lock().unwrap().len(), 4);
    assert_eq!(handle.state(), StreamState::Stopped);
}

#[tokio::test]
async fn test_backoff_grows_between_attempts() {
    let connector = FakeConnector::new(vec![]);
    let (tx, _rx) = mpsc::channel(8);
    let (on_error, _) = recording_handler();
    let cfg = ReconnectConfig {
        base_delay: Duration::from_millis(40),
        ..config(3)
    };

    let started = Instant::now();
    let mut handle = spawn(connector, cfg, tx, on_error, CancellationToken::new());
    let exit = handle.done().await;

    // Two sleeps (40ms, 80ms) between three attempts, none after the last
    assert_eq!(exit, StreamExit::Exhausted { attempts: 3 });
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(120), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_successful_connection_resets_attempt_counter() {
    let connector = FakeConnector::new(vec![
        Session::Refuse,
        Session::Refuse,
        Session::Deliver(vec![bar(0, 2000.0)]),
    ]);
    let (tx, mut rx) = mpsc::channel(8);
    let (on_error, seen) = recording_handler();

    let mut handle = spawn(connector.clone(), config(3), tx, on_error, CancellationToken::new());
    let exit = handle.done().await;

    // 2 refusals, 1 session that drops (attempt 1 again), then 2 more refusals
    assert_eq!(exit, StreamExit::Exhausted { attempts: 3 });
    assert_eq!(connector.connects(), 5);
    assert_eq!(seen.lock().unwrap().len(), 5);
    assert_eq!(rx.recv().await.unwrap().close, 2000.0);
}

#[tokio::test]
async fn test_bars_delivered_in_order_across_reconnects() {
    let connector = FakeConnector::new(vec![
        Session::Deliver(vec![bar(0, 1.0), bar(1, 2.0)]),
        Session::Refuse,
        Session::DeliverThenIdle(vec![bar(2, 3.0), bar(3, 4.0)]),
    ]);
    let (tx, mut rx) = mpsc::channel(8);
    let (on_error, _) = recording_handler();

    let mut handle = spawn(connector, config(5), tx, on_error, CancellationToken::new());

    let mut closes = Vec::new();
    for _ in 0..4 {
        let bar = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        closes.push(bar.close);
    }
    assert_eq!(closes, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(handle.state(), StreamState::Connected);

    let exit = handle.shutdown(Duration::from_secs(5)).await;
    assert_eq!(exit, Some(StreamExit::StopRequested));
}

#[tokio::test]
async fn test_cancel_token_stops_connected_stream() {
    let connector = FakeConnector::new(vec![Session::DeliverThenIdle(vec![bar(0, 1.0)])]);
    let (tx, mut rx) = mpsc::channel(8);
    let (on_error, seen) = recording_handler();
    let cancel = CancellationToken::new();

    let mut handle = spawn(connector, config(3), tx, on_error, cancel.clone());
    rx.recv().await.unwrap();

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), handle.done())
        .await
        .unwrap();

    assert_eq!(exit, StreamExit::Cancelled);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let connector = FakeConnector::new(vec![]);
    let (tx, _rx) = mpsc::channel(8);
    let (on_error, seen) = recording_handler();
    let cancel = CancellationToken::new();
    let cfg = ReconnectConfig {
        base_delay: Duration::from_secs(60),
        ..config(10)
    };

    let mut handle = spawn(connector.clone(), cfg, tx, on_error, cancel.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != StreamState::Backoff {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream should enter backoff");
    assert_eq!(seen.lock().unwrap().len(), 1);

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), handle.done())
        .await
        .unwrap();
    assert_eq!(exit, StreamExit::Cancelled);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_dropped_receiver_ends_stream() {
    let connector = FakeConnector::new(vec![Session::DeliverThenIdle(vec![bar(0, 1.0)])]);
    let (tx, rx) = mpsc::channel(8);
    drop(rx);
    let (on_error, _) = recording_handler();

    let mut handle = spawn(connector, config(3), tx, on_error, CancellationToken::new());
    let exit = tokio::time::timeout(Duration::from_secs(5), handle.done())
        .await
        .unwrap();

    assert_eq!(exit, StreamExit::SinkClosed);
}

#[tokio::test]
async fn test_connect_timeout_counts_as_failure() {
    let connector = FakeConnector::new(vec![
        Session::Slow(Duration::from_secs(30)),
        Session::Slow(Duration::from_secs(30)),
    ]);
    let (tx, _rx) = mpsc::channel(8);
    let (on_error, seen) = recording_handler();
    let cfg = ReconnectConfig {
        connect_timeout: Duration::from_millis(20),
        ..config(2)
    };

    let mut handle = spawn(connector, cfg, tx, on_error, CancellationToken::new());
    let exit = tokio::time::timeout(Duration::from_secs(5), handle.done())
        .await
        .unwrap();

    assert_eq!(exit, StreamExit::Exhausted { attempts: 2 });
    assert_eq!(*seen.lock().unwrap(), vec![ErrorKind::Timeout, ErrorKind::Timeout]);
}

#[tokio::test]
async fn test_shutdown_after_exit_returns_cached_result() {
    let connector = FakeConnector::new(vec![]);
    let (tx, _rx) = mpsc::channel(8);
    let (on_error, _) = recording_handler();

    let mut handle = spawn(connector, config(1), tx, on_error, CancellationToken::new());
    assert_eq!(handle.done().await, StreamExit::Exhausted { attempts: 1 });

    assert_eq!(
        handle.shutdown(Duration::from_millis(10)).await,
        Some(StreamExit::Exhausted { attempts: 1 })
    );
    assert_eq!(handle.done().await, StreamExit::Exhausted { attempts: 1 });
}

async fn wait_connected(handle: &perpbot::exchange::StreamHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.state() != StreamState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream should connect");
}

fn burst(n: i64) -> Vec<PriceBar> {
    (0..n).map(|i| bar(i, 2000.0 + i as f64)).collect()
}

#[tokio::test]
async fn test_cancel_stops_stream_blocked_on_full_sink() {
    let connector = FakeConnector::new(vec![Session::DeliverThenIdle(burst(10))]);
    // Never drained: the loop parks on the second send
    let (tx, _rx) = mpsc::channel(1);
    let (on_error, _) = recording_handler();
    let cancel = CancellationToken::new();

    let mut handle = spawn(connector, config(3), tx, on_error, cancel.clone());
    wait_connected(&handle).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(2), handle.done())
        .await
        .expect("cancel should not wait on the sink");
    assert_eq!(exit, StreamExit::Cancelled);
}

#[tokio::test]
async fn test_shutdown_stops_stream_blocked_on_full_sink() {
    let connector = FakeConnector::new(vec![Session::DeliverThenIdle(burst(10))]);
    let (tx, mut rx) = mpsc::channel(1);
    let (on_error, _) = recording_handler();

    let mut handle = spawn(connector, config(3), tx, on_error, CancellationToken::new());
    wait_connected(&handle).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let exit = handle.shutdown(Duration::from_secs(2)).await;
    assert_eq!(exit, Some(StreamExit::StopRequested));

    // Only the bar that fit in the sink was delivered
    assert_eq!(rx.recv().await.unwrap().close, 2000.0);
    assert!(rx.recv().await.is_none());
}
