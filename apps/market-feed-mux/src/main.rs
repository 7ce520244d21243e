//! Market Feed Mux Binary
//!
//! Connects to the exchange feed, subscribes to the configured symbols
//! with logging consumers and serves health endpoints.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed-mux
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_FEED_WS_URL`: Upstream WebSocket (default: <wss://api.hyperliquid.xyz/ws>)
//! - `MARKET_FEED_SYMBOLS`: Comma-separated coins (default: BTC,ETH)
//! - `MARKET_FEED_AUTO_CONNECT`: Connect on first subscribe (default: true)
//! - `MARKET_FEED_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `MARKET_FEED_THROTTLE_*_MS`: Default throttle windows
//! - `MARKET_FEED_RECONNECT_*`, `MARKET_FEED_HEARTBEAT_*`: Connection tuning
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: `market_feed_mux=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use market_feed_mux::infrastructure::health::{HealthServer, HealthServerState};
use market_feed_mux::infrastructure::telemetry;
use market_feed_mux::{
    FeedConfig, HyperliquidCodec, MarketFeedManager, SubscribeOptions, SubscriptionHandle,
    SystemClock, TokioScheduler, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long the health endpoint may take to drain after a signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market feed mux");

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = FeedConfig::from_env().context("invalid feed configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let transport = WebSocketTransport::new(config.endpoint.url.clone())
        .with_connect_timeout(config.endpoint.connect_timeout);
    let scheduler = TokioScheduler::current().context("no tokio runtime")?;
    let manager = MarketFeedManager::new(
        config.manager_config(),
        Arc::new(transport),
        Arc::new(HyperliquidCodec::new()),
        Arc::new(SystemClock),
        Arc::new(scheduler),
    );

    manager.on_health(|snapshot| {
        tracing::info!(
            status = %snapshot.status(),
            quality = %snapshot.quality(),
            score = snapshot.score(),
            "Feed health"
        );
    });

    let handles = subscribe_logging_consumers(&manager, &config.symbols)?;
    tracing::info!(subscriptions = handles.len(), "Consumers registered");

    // Probes and scrapes
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        manager.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_addr(),
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health endpoint failed");
        }
    });

    // Connect in the background so the health server stays reachable
    let connector = manager.clone();
    tokio::spawn(async move {
        match connector.connect().await {
            Ok(()) => tracing::info!("Feed connected"),
            Err(e) => tracing::error!(error = %e, "Feed connection failed"),
        }
    });

    tracing::info!("Market feed mux ready");

    await_shutdown(shutdown_token).await;

    for handle in &handles {
        manager.unsubscribe(handle);
    }
    manager.disconnect();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, health_task)
        .await
        .is_err()
    {
        tracing::warn!("Health server did not stop in time");
    }

    tracing::info!(metrics = ?manager.metrics(), "Market feed mux stopped");
    Ok(())
}

/// Subscribe trades and order books for every symbol, plus mid prices.
fn subscribe_logging_consumers(
    manager: &MarketFeedManager,
    symbols: &[String],
) -> anyhow::Result<Vec<SubscriptionHandle>> {
    let mut handles = Vec::with_capacity(symbols.len() * 2 + 1);

    for symbol in symbols {
        let trades = manager
            .subscribe_trades(symbol, SubscribeOptions::default(), |batch| {
                if let Some(last) = batch.last() {
                    tracing::info!(
                        symbol = %batch.symbol,
                        trades = batch.trades.len(),
                        last_price = %last.price,
                        notional = %batch.total_notional(),
                        "Trades"
                    );
                }
            })
            .with_context(|| format!("invalid symbol {symbol:?}"))?;
        handles.push(trades);

        let book = manager
            .subscribe_order_book(symbol, SubscribeOptions::default(), |book| {
                tracing::info!(
                    symbol = %book.symbol,
                    bid = ?book.best_bid().map(|level| level.price),
                    ask = ?book.best_ask().map(|level| level.price),
                    spread = ?book.spread(),
                    "Order book"
                );
            })
            .with_context(|| format!("invalid symbol {symbol:?}"))?;
        handles.push(book);
    }

    handles.push(
        manager.subscribe_mid_prices(SubscribeOptions::default(), |mids| {
            tracing::debug!(coins = mids.len(), "Mid prices");
        }),
    );

    Ok(handles)
}

/// Apply the nearest `.env`, searching upward from the working directory.
/// Variables already set in the environment win.
fn load_dotenv() {
    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    let Some(path) = cwd
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.is_file())
    else {
        return;
    };
    if let Err(e) = dotenvy::from_path(&path) {
        eprintln!("Ignoring unreadable {}: {e}", path.display());
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        url = %config.endpoint.url,
        symbols = ?config.symbols,
        auto_connect = config.auto_connect,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        trades_ms = config.throttle.trades.as_millis(),
        order_book_ms = config.throttle.order_book.as_millis(),
        mid_prices_ms = config.throttle.mid_prices.as_millis(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        "Feed tuning"
    );
}

/// Resolve on the first interrupt or terminate signal, then cancel `token`.
async fn await_shutdown(token: CancellationToken) {
    let signal_name = tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGINT");
                sigterm().await
            }
        },
        name = sigterm() => name,
    };

    tracing::info!(
        signal = signal_name,
        grace_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Shutting down"
    );
    token.cancel();
}

#[cfg(unix)]
async fn sigterm() -> &'static str {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
    "SIGTERM"
}

#[cfg(not(unix))]
async fn sigterm() -> &'static str {
    std::future::pending::<&'static str>().await
}
