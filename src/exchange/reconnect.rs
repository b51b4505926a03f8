use super::error::{self, ErrorKind, ExchangeError};
use crate::models::PriceBar;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Jitter added on top of each backoff delay, as a fraction of that delay
pub const JITTER_RATIO: f64 = 0.1;

pub type BarStream = BoxStream<'static, Result<PriceBar, ExchangeError>>;

/// Callback invoked for every connection failure (connect error or disconnect)
pub type ErrorHandler = Arc<dyn Fn(&ExchangeError) + Send + Sync>;

/// Opens one live subscription. The returned stream ends (or yields an error)
/// when the connection drops.
#[async_trait]
pub trait BarConnector: Send + Sync {
    async fn connect(&self, symbol: &str, interval: &str) -> Result<BarStream, ExchangeError>;
}

/// Source of the random factor in `[0, 1)` applied to the jitter
pub trait JitterSource: Send {
    fn fraction(&mut self) -> f64;
}

pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn fraction(&mut self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same fraction. Useful for deterministic timing.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn fraction(&mut self) -> f64 {
        self.0
    }
}

/// Delay before connection attempt `attempt` (1-based), without jitter:
/// `base * 2^(attempt - 1)`, saturating instead of overflowing.
pub fn base_backoff(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// Full backoff delay: base delay plus up to `JITTER_RATIO` of it.
/// `jitter_fraction` is clamped to `[0, 1]`.
pub fn backoff_delay(attempt: u32, base: Duration, jitter_fraction: f64) -> Duration {
    let delay = base_backoff(attempt, base);
    let jitter = delay.mul_f64(JITTER_RATIO * jitter_fraction.clamp(0.0, 1.0));
    delay.saturating_add(jitter)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

/// Why the stream subsystem terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// Shared cancellation token fired
    Cancelled,
    /// Caller asked the stream to stop (or dropped the stop channel)
    StopRequested,
    /// Gave up after this many consecutive failed attempts
    Exhausted { attempts: u32 },
    /// The bar receiver was dropped
    SinkClosed,
}

/// Attempt bookkeeping for the reconnect state machine
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    state: StreamState,
    attempts: u32,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: StreamState::Connecting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Consecutive failures since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn connecting(&mut self) {
        self.state = StreamState::Connecting;
    }

    pub fn connected(&mut self) {
        self.attempts = 0;
        self.state = StreamState::Connected;
    }

    /// Record a failed attempt. Returns the attempt number to back off for,
    /// or `None` once the maximum is reached (state becomes `Stopped`).
    pub fn failed(&mut self) -> Option<u32> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            self.state = StreamState::Stopped;
            None
        } else {
            self.state = StreamState::Backoff;
            Some(self.attempts)
        }
    }

    pub fn stop(&mut self) {
        self.state = StreamState::Stopped;
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Caller side of a running stream subsystem
pub struct StreamHandle {
    done: oneshot::Receiver<StreamExit>,
    stop: mpsc::Sender<()>,
    state: watch::Receiver<StreamState>,
    exit: Option<StreamExit>,
}

impl StreamHandle {
    /// Current state of the reconnect state machine
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Resolves once the subsystem has terminated. Cancel-safe.
    pub async fn done(&mut self) -> StreamExit {
        if let Some(exit) = self.exit {
            return exit;
        }
        // Sender dropped without a value means the task was torn down by the runtime
        let exit = (&mut self.done).await.unwrap_or(StreamExit::Cancelled);
        self.exit = Some(exit);
        exit
    }

    /// Ask the stream to stop, racing its own termination, and wait up to
    /// `grace` for it to finish. `None` if it did not finish in time.
    ///
    /// The stop channel holds one buffered request, so sending it does not
    /// mean the loop has seen it yet; only [`StreamHandle::done`] confirms the
    /// exit. A request buffered while the loop is already returning for
    /// another reason is simply dropped with the channel, and calling this
    /// again after a timeout reuses the pending request.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<StreamExit> {
        if let Some(exit) = self.exit {
            return Some(exit);
        }

        let stop = self.stop.clone();
        let wait = async {
            tokio::select! {
                exit = self.done() => return exit,
                _ = stop.send(()) => {}
            }
            self.done().await
        };

        tokio::time::timeout(grace, wait).await.ok()
    }
}

/// Reconnecting subscription driven by a [`BarConnector`]
pub struct ReconnectingStream {
    connector: Arc<dyn BarConnector>,
    config: ReconnectConfig,
    jitter: Box<dyn JitterSource>,
}

impl ReconnectingStream {
    pub fn new(connector: Arc<dyn BarConnector>, config: ReconnectConfig) -> Self {
        Self {
            connector,
            config,
            jitter: Box::new(ThreadRngJitter),
        }
    }

    pub fn with_jitter(mut self, jitter: Box<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Spawn the receive/reconnect loop on the current runtime
    pub fn spawn(
        self,
        symbol: &str,
        interval: &str,
        bars: mpsc::Sender<PriceBar>,
        on_error: ErrorHandler,
        cancel: CancellationToken,
    ) -> StreamHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(StreamState::Connecting);

        let symbol = symbol.to_string();
        let interval = interval.to_string();

        tokio::spawn(async move {
            let exit = self
                .run(&symbol, &interval, bars, on_error, cancel, stop_rx, &state_tx)
                .await;
            state_tx.send_replace(StreamState::Stopped);
            tracing::info!(symbol = %symbol, interval = %interval, ?exit, "Price stream stopped");
            let _ = done_tx.send(exit);
        });

        StreamHandle {
            done: done_rx,
            stop: stop_tx,
            state: state_rx,
            exit: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        mut self,
        symbol: &str,
        interval: &str,
        bars: mpsc::Sender<PriceBar>,
        on_error: ErrorHandler,
        cancel: CancellationToken,
        mut stop: mpsc::Receiver<()>,
        state: &watch::Sender<StreamState>,
    ) -> StreamExit {
        let mut policy = ReconnectPolicy::new(self.config.max_reconnect_attempts);

        loop {
            policy.connecting();
            state.send_replace(policy.state());

            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(symbol, interval),
            );

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamExit::Cancelled,
                _ = stop.recv() => return StreamExit::StopRequested,
                result = connect => result,
            };

            let failure = match connected {
                Err(_) => error::deadline_exceeded("stream_connect"),
                Ok(Err(e)) => e,
                Ok(Ok(mut stream)) => {
                    policy.connected();
                    state.send_replace(policy.state());
                    tracing::info!(symbol = %symbol, interval = %interval, "Price stream connected");

                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return StreamExit::Cancelled,
                            _ = stop.recv() => return StreamExit::StopRequested,
                            item = stream.next() => match item {
                                // A full sink must not pin the task past cancel or stop
                                Some(Ok(bar)) => tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => return StreamExit::Cancelled,
                                    _ = stop.recv() => return StreamExit::StopRequested,
                                    sent = bars.send(bar) => {
                                        if sent.is_err() {
                                            return StreamExit::SinkClosed;
                                        }
                                    }
                                },
                                Some(Err(e)) => break e,
                                None => {
                                    break ExchangeError::new(
                                        ErrorKind::ConnectionFailed,
                                        "stream_receive",
                                        "stream closed by server",
                                    )
                                }
                            },
                        }
                    }
                }
            };

            on_error(&failure);

            let attempt = match policy.failed() {
                Some(attempt) => attempt,
                None => {
                    state.send_replace(policy.state());
                    tracing::error!(
                        symbol = %symbol,
                        attempts = policy.attempts(),
                        "Price stream giving up after {} consecutive failures: {}",
                        policy.attempts(),
                        failure
                    );
                    return StreamExit::Exhausted {
                        attempts: policy.attempts(),
                    };
                }
            };
            state.send_replace(policy.state());

            let delay = backoff_delay(attempt, self.config.base_delay, self.jitter.fraction());
            tracing::warn!(
                symbol = %symbol,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Price stream failure, reconnecting: {}",
                failure
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamExit::Cancelled,
                _ = stop.recv() => return StreamExit::StopRequested,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(base_backoff(1, base), Duration::from_millis(500));
        assert_eq!(base_backoff(2, base), Duration::from_millis(1000));
        assert_eq!(base_backoff(3, base), Duration::from_millis(2000));
        assert_eq!(base_backoff(5, base), Duration::from_millis(8000));
    }

    #[test]
    fn test_base_backoff_strictly_increasing() {
        let base = Duration::from_secs(1);
        let delays: Vec<Duration> = (1..=10).map(|n| base_backoff(n, base)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let base = Duration::from_secs(1);
        assert_eq!(base_backoff(0, base), base);
    }

    #[test]
    fn test_backoff_saturates() {
        let delay = base_backoff(u32::MAX, Duration::from_secs(u64::MAX / 2));
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(3, base, 0.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, base, 1.0), Duration::from_millis(4400));
        assert_eq!(backoff_delay(3, base, 0.5), Duration::from_millis(4200));
        // Out-of-range fractions are clamped
        assert_eq!(backoff_delay(3, base, 7.0), Duration::from_millis(4400));
    }

    #[test]
    fn test_thread_rng_jitter_in_range() {
        let mut jitter = ThreadRngJitter;
        for _ in 0..100 {
            let f = jitter.fraction();
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn test_policy_stops_exactly_at_max() {
        let mut policy = ReconnectPolicy::new(3);
        assert_eq!(policy.failed(), Some(1));
        assert_eq!(policy.state(), StreamState::Backoff);
        assert_eq!(policy.failed(), Some(2));
        assert_eq!(policy.failed(), None);
        assert_eq!(policy.state(), StreamState::Stopped);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_policy_resets_on_connect() {
        let mut policy = ReconnectPolicy::new(3);
        policy.failed();
        policy.failed();
        policy.connected();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.state(), StreamState::Connected);

        // Budget is fully restored
        assert_eq!(policy.failed(), Some(1));
        assert_eq!(policy.failed(), Some(2));
        assert_eq!(policy.failed(), None);
    }

    #[test]
    fn test_policy_zero_max_means_single_attempt() {
        let mut policy = ReconnectPolicy::new(0);
        assert_eq!(policy.failed(), None);
        assert_eq!(policy.state(), StreamState::Stopped);
    }
}
