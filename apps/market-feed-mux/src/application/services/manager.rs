//! Market Feed Manager
//!
//! The single entry point consumers use. It wires the subscription
//! multiplexer, the connection supervisor and the health monitor together
//! and exposes subscribe/unsubscribe, connect/disconnect and health
//! queries.
//!
//! The manager is cheap to clone; all clones share one upstream
//! connection.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio_stream::wrappers::WatchStream;

use super::health::{HealthConfig, HealthListenerHandle, HealthMonitor};
use super::mux::{SubscriptionHandle, SubscriptionMux};
use super::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::application::ports::{Clock, FrameCodec, Scheduler, Transport};
use crate::domain::health::{
    ConnectionQuality, ConnectionState, ConnectionStatus, DisconnectReason, HealthSnapshot,
};
use crate::domain::streaming::{MarketEvent, MidPriceMap, OrderBookSnapshot, TradeBatch};
use crate::domain::subscription::{ChannelType, KeyError, SubscriptionKey};

// =============================================================================
// Configuration
// =============================================================================

/// Default throttle windows per channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Trades window (default: 500ms).
    pub trades: Duration,
    /// Order-book window (default: 1s).
    pub order_book: Duration,
    /// Mid-price window (default: 2s).
    pub mid_prices: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            trades: Duration::from_millis(500),
            order_book: Duration::from_millis(1000),
            mid_prices: Duration::from_millis(2000),
        }
    }
}

impl ThrottleConfig {
    /// Default window for a channel type.
    #[must_use]
    pub const fn window_for(&self, channel: ChannelType) -> Duration {
        match channel {
            ChannelType::Trades => self.trades,
            ChannelType::OrderBook => self.order_book,
            ChannelType::MidPrices => self.mid_prices,
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Reconnect and heartbeat settings.
    pub supervisor: SupervisorConfig,
    /// Health monitoring settings.
    pub health: HealthConfig,
    /// Default throttle windows.
    pub throttle: ThrottleConfig,
    /// Start connecting on the first subscribe if `connect()` was never
    /// called.
    pub auto_connect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            throttle: ThrottleConfig::default(),
            auto_connect: true,
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Throttle window override. `None` uses the channel default; zero
    /// disables throttling.
    pub throttle: Option<Duration>,
}

impl SubscribeOptions {
    /// Override the throttle window.
    #[must_use]
    pub const fn throttle(window: Duration) -> Self {
        Self {
            throttle: Some(window),
        }
    }

    /// Deliver every message.
    #[must_use]
    pub const fn unthrottled() -> Self {
        Self::throttle(Duration::ZERO)
    }
}

// =============================================================================
// Errors & Metrics
// =============================================================================

/// Manager errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// Reconnection gave up.
    #[error("gave up after {attempts} connection attempts")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// `disconnect()` was called while connecting.
    #[error("connect aborted by disconnect")]
    ConnectAborted,

    /// Called outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Feed counters exposed to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerMetrics {
    /// Inbound frames received.
    pub messages_received: u64,
    /// Established sessions lost and retried.
    pub reconnects: u64,
    /// Inbound frames dropped as malformed.
    pub malformed_frames: u64,
    /// Control frames written upstream.
    pub frames_sent: u64,
    /// Keys with at least one handler.
    pub active_keys: usize,
    /// Registered handlers.
    pub handlers: usize,
}

// =============================================================================
// Manager
// =============================================================================

struct ManagerInner {
    config: ManagerConfig,
    mux: Arc<SubscriptionMux>,
    health: Arc<HealthMonitor>,
    supervisor: Arc<ConnectionSupervisor>,
    runtime: Option<Handle>,
}

/// Multiplexes consumer subscriptions onto one upstream connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use market_feed_mux::{
///     HyperliquidCodec, ManagerConfig, MarketFeedManager, SubscribeOptions, SystemClock,
///     TokioScheduler, WebSocketTransport,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = MarketFeedManager::new(
///     ManagerConfig::default(),
///     Arc::new(WebSocketTransport::new("wss://api.hyperliquid.xyz/ws")),
///     Arc::new(HyperliquidCodec::new()),
///     Arc::new(SystemClock),
///     Arc::new(TokioScheduler::current()?),
/// );
///
/// manager.connect().await?;
/// let handle = manager.subscribe_trades("BTC", SubscribeOptions::default(), |batch| {
///     println!("{} trades", batch.trades.len());
/// })?;
///
/// manager.unsubscribe(&handle);
/// manager.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MarketFeedManager {
    inner: Arc<ManagerInner>,
}

impl MarketFeedManager {
    /// Create a manager. Nothing connects until `connect()` or, with
    /// `auto_connect`, the first subscribe.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn FrameCodec>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let mux = Arc::new(SubscriptionMux::new(
            Arc::clone(&clock),
            Arc::clone(&scheduler),
        ));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), clock, scheduler));
        health.start_ticker();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.supervisor.clone(),
            transport,
            codec,
            Arc::clone(&mux),
            Arc::clone(&health),
        ));

        Self {
            inner: Arc::new(ManagerInner {
                config,
                mux,
                health,
                supervisor,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Connect upstream and wait for the outcome.
    ///
    /// Idempotent: if already connecting or connected, waits for the same
    /// outcome as the first caller.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ReconnectExhausted`] if every attempt failed
    /// and [`ManagerError::ConnectAborted`] if `disconnect()` was called
    /// first.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        self.inner.supervisor.start(&runtime);

        let mut updates = self.inner.health.watch();
        let outcome = updates
            .wait_for(|snapshot| snapshot.status() != ConnectionStatus::Connecting)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| ManagerError::ConnectAborted)?;

        match outcome {
            HealthSnapshot::Connected { .. } | HealthSnapshot::Degraded { .. } => Ok(()),
            HealthSnapshot::Disconnected {
                reason: DisconnectReason::ReconnectExhausted { attempts },
            } => Err(ManagerError::ReconnectExhausted { attempts }),
            HealthSnapshot::Disconnected { .. } | HealthSnapshot::Connecting { .. } => {
                Err(ManagerError::ConnectAborted)
            }
        }
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Subscriptions are kept and replayed by the next `connect()`.
    pub fn disconnect(&self) {
        self.inner.supervisor.stop();
    }

    fn auto_connect(&self) {
        if !self.inner.config.auto_connect || !self.inner.supervisor.is_idle() {
            return;
        }

        match Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone())
        {
            Some(runtime) => {
                tracing::debug!("Auto-connecting on first subscribe");
                self.inner.supervisor.start(&runtime);
            }
            None => tracing::warn!("Cannot auto-connect outside a tokio runtime"),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Register `handler` for `key`.
    ///
    /// Never fails: if no session is live the key is subscribed upstream on
    /// the next successful connect.
    pub fn subscribe<F>(
        &self,
        key: SubscriptionKey,
        options: SubscribeOptions,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&MarketEvent) + Send + Sync + 'static,
    {
        let window = options
            .throttle
            .unwrap_or_else(|| self.inner.config.throttle.window_for(key.channel_type()));
        let handle = self.inner.mux.subscribe(key, window, Arc::new(handler));
        self.auto_connect();
        handle
    }

    /// Subscribe to trades for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySymbol`] for a blank symbol.
    pub fn subscribe_trades<F>(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionHandle, KeyError>
    where
        F: Fn(&TradeBatch) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::trades(symbol)?;
        Ok(self.subscribe(key, options, move |event: &MarketEvent| {
            if let Some(batch) = event.as_trades() {
                handler(batch);
            }
        }))
    }

    /// Subscribe to order-book snapshots for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySymbol`] for a blank symbol.
    pub fn subscribe_order_book<F>(
        &self,
        symbol: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionHandle, KeyError>
    where
        F: Fn(&OrderBookSnapshot) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::order_book(symbol)?;
        Ok(self.subscribe(key, options, move |event: &MarketEvent| {
            if let Some(book) = event.as_order_book() {
                handler(book);
            }
        }))
    }

    /// Subscribe to the global mid-price stream.
    pub fn subscribe_mid_prices<F>(&self, options: SubscribeOptions, handler: F) -> SubscriptionHandle
    where
        F: Fn(&MidPriceMap) + Send + Sync + 'static,
    {
        self.subscribe(
            SubscriptionKey::MidPrices,
            options,
            move |event: &MarketEvent| {
                if let Some(mids) = event.as_mid_prices() {
                    handler(mids);
                }
            },
        )
    }

    /// Remove a handler. Returns false if it was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.mux.unsubscribe(handle)
    }

    /// Keys with at least one handler.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.inner.mux.active_keys()
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Whether a session is open.
    #[must_use]
    pub fn connection_status(&self) -> bool {
        self.inner.health.status().is_connected()
    }

    /// Current quality bucket.
    #[must_use]
    pub fn connection_quality(&self) -> ConnectionQuality {
        self.inner.health.quality()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.health.state()
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// Register a health listener.
    pub fn on_health<F>(&self, listener: F) -> HealthListenerHandle
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        self.inner.health.on_health(Arc::new(listener))
    }

    /// Remove a health listener. Returns false if it was already removed.
    pub fn remove_health_listener(&self, handle: HealthListenerHandle) -> bool {
        self.inner.health.remove_listener(handle)
    }

    /// Stream of health snapshots, starting with the current one.
    #[must_use]
    pub fn health_updates(&self) -> WatchStream<HealthSnapshot> {
        WatchStream::new(self.inner.health.watch())
    }

    /// Feed counters.
    #[must_use]
    pub fn metrics(&self) -> ManagerMetrics {
        let counters = self.inner.supervisor.counters();
        let stats = self.inner.mux.stats();
        ManagerMetrics {
            messages_received: counters.messages_received(),
            reconnects: counters.reconnects(),
            malformed_frames: counters.malformed_frames(),
            frames_sent: counters.frames_sent(),
            active_keys: stats.active_keys,
            handlers: stats.handlers,
        }
    }
}

impl std::fmt::Debug for MarketFeedManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeedManager")
            .field("config", &self.inner.config)
            .field("supervisor", &self.inner.supervisor)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
