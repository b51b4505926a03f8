use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::Parser;
use perpbot::config::Settings;
use perpbot::db::{MemoryPositionStore, PositionStore, PostgresPositionStore};
use perpbot::exchange::{
    ErrorHandler, ExchangeError, ExchangeGateway, MarketDataClient, PaperExchange, StreamExit,
};
use perpbot::execution::Orchestrator;
use perpbot::strategy::SmaCrossStrategy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Leveraged perpetual futures trading engine (paper execution)")]
struct Args {
    /// Config file, extension optional (missing file means built-in defaults)
    #[arg(short, long, default_value = "config/default")]
    config: String,

    /// Keep positions in memory instead of Postgres
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let settings =
        Settings::load(&args.config).map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    let engine_config = settings.engine_config();
    let symbol = engine_config.symbol.clone();
    let interval = engine_config.interval.clone();

    tracing::info!("🚀 perpbot starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Market: {} {}", symbol, interval);
    tracing::info!(
        "  Entry: {} {} @ {}x leverage",
        engine_config.side,
        engine_config.quantity,
        engine_config.leverage
    );
    tracing::info!(
        "  Stop Loss: {}%, Take Profit: {}%",
        engine_config.stop_loss_pct * 100.0,
        engine_config.take_profit_pct * 100.0
    );
    tracing::info!("  Max Daily Trades: {}", engine_config.limits.max_daily_trades);

    let market = MarketDataClient::with_timeout(
        settings.exchange.rest_url.clone(),
        Duration::from_secs(settings.exchange.request_timeout_secs),
    );
    let exchange: Arc<dyn ExchangeGateway> = Arc::new(PaperExchange::new(
        market,
        settings.exchange.ws_url.clone(),
        settings.reconnect_config(),
    ));
    let store = open_store(&settings, args.memory_store).await?;
    let strategy = SmaCrossStrategy::new(settings.strategy.clone(), engine_config.side);

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    // Startup sequence: any failure here is fatal
    check_clock(exchange.as_ref(), settings.exchange.max_clock_drift_ms).await?;

    let mut orchestrator =
        Orchestrator::new(engine_config, exchange.clone(), store, Box::new(strategy));
    orchestrator
        .sync_leverage()
        .await
        .context("Leverage reconciliation failed")?;
    orchestrator
        .restore()
        .await
        .context("Restoring position state failed")?;
    orchestrator
        .load_history()
        .await
        .context("Loading price history failed")?;

    let (bar_tx, bar_rx) = mpsc::channel(settings.stream.channel_capacity);
    let on_error: ErrorHandler = Arc::new(|e: &ExchangeError| {
        tracing::warn!(kind = %e.kind, "Price stream error: {}", e);
    });
    let mut stream = exchange
        .stream_price_bars(&symbol, &interval, bar_tx, on_error, cancel.clone())
        .context("Starting price stream failed")?;

    let engine = tokio::spawn(orchestrator.run(bar_rx, cancel.clone()));

    tracing::info!("✅ Engine running. Press Ctrl+C to stop...");

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("⚠️  Shutdown requested");
        }
        exit = stream.done() => match exit {
            StreamExit::Exhausted { attempts } => {
                tracing::error!("Price stream gave up after {} attempts, shutting down", attempts);
            }
            other => tracing::warn!(?other, "Price stream ended, shutting down"),
        },
    }

    let grace = settings.shutdown_grace();
    match stream.shutdown(grace).await {
        Some(exit) => tracing::info!(?exit, "Price stream stopped"),
        None => tracing::warn!("Price stream did not stop within {:?}, continuing", grace),
    }
    cancel.cancel();

    match engine.await {
        Ok(orchestrator) => {
            if let Some(p) = orchestrator.current_position() {
                tracing::info!(
                    "Open {} position left with protective orders: {:.4} @ {:.4}",
                    p.side,
                    p.quantity,
                    p.entry_price
                );
            }
            if orchestrator.has_unsynced_close() {
                tracing::error!("A closed position was never persisted; reconcile the store manually");
            }
            tracing::info!("Trades today: {}", orchestrator.trades_today());
        }
        Err(e) => tracing::error!("Orchestrator task failed: {}", e),
    }

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("perpbot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(settings: &Settings, memory: bool) -> anyhow::Result<Arc<dyn PositionStore>> {
    if memory {
        tracing::warn!("Using in-memory position store; state is lost on exit");
        return Ok(Arc::new(MemoryPositionStore::new()));
    }

    let url = settings
        .database
        .resolved_url()
        .context("No database URL: set database.url or DATABASE_URL, or pass --memory-store")?;
    let store = PostgresPositionStore::connect(&url, settings.database.max_connections)
        .await
        .context("Connecting to Postgres failed")?;

    Ok(Arc::new(store))
}

async fn check_clock(exchange: &dyn ExchangeGateway, max_drift_ms: i64) -> anyhow::Result<()> {
    let server = exchange
        .server_time()
        .await
        .context("Time sync with exchange failed")?;
    let drift_ms = (Utc::now() - server).num_milliseconds();

    if drift_ms.abs() > max_drift_ms {
        tracing::warn!(
            "Local clock is {} ms off exchange time (limit {} ms)",
            drift_ms,
            max_drift_ms
        );
    } else {
        tracing::info!("Clock synced with exchange (drift {} ms)", drift_ms);
    }

    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("⚠️  Received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
