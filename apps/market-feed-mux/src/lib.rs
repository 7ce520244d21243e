//! Market Feed Mux - Exchange Subscription Multiplexer
//!
//! Maintains a single connection to an exchange market-data WebSocket and
//! multiplexes logical subscriptions onto it for many in-process consumers.
//! Identical subscriptions share one upstream stream; each consumer gets
//! its own throttle window; the connection reconnects with backoff and
//! replays every active subscription.
//!
//! # Layout
//!
//! - **Domain**
//!   - `streaming`: Order books, trades, mid prices, control frames
//!   - `subscription`: Subscription keys and the handler registry
//!   - `health`: Connection status and quality scoring
//!
//! - **Application**
//!   - `ports`: Transport, codec, clock and scheduler interfaces
//!   - `services`: Manager facade, multiplexer, supervisor, health, throttle
//!
//! - **Infrastructure**
//!   - `hyperliquid`: WebSocket transport and JSON codec
//!   - `clock`: Tokio-backed and manual clocks
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Prometheus and tracing
//!
//! # Flow
//!
//! ```text
//!                      ┌──────────────┐  subscribe/unsubscribe
//! Consumer A ─────────►│              │─────────────┐
//! Consumer B ─────────►│ Subscription │             ▼
//! Consumer C ─────────►│     Mux      │     ┌───────────────┐
//!      ▲               │              │     │  Connection   │◄──► Exchange WS
//!      │  throttled    └──────────────┘     │  Supervisor   │
//!      └──────────────────── dispatch ◄─────└───────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines
    )
)]

/// Market data, subscription keys and connection health. No I/O.
pub mod domain;

/// Ports and the services built on them.
pub mod application;

/// WebSocket transport, codec, clocks, config and observability.
pub mod infrastructure;

// Domain types
pub use domain::health::{
    ConnectionQuality, ConnectionState, ConnectionStatus, DisconnectReason, HealthSnapshot,
};
pub use domain::streaming::{
    BookLevel, MarketEvent, MidPriceMap, OrderBookSnapshot, Trade, TradeBatch, TradeSide,
};
pub use domain::subscription::{ChannelType, KeyError, SubscriptionKey, Symbol};

// Ports
pub use application::ports::{
    Clock, CodecError, FrameCodec, ScheduledTask, Scheduler, Transport, TransportError,
    TransportLink,
};

// Manager facade
pub use application::services::{
    HealthListenerHandle, ManagerConfig, ManagerError, ManagerMetrics, MarketFeedManager,
    SubscribeOptions, SubscriptionHandle, ThrottleConfig,
};

// Adapters and ambient
pub use infrastructure::clock::{ManualClock, SystemClock, TokioScheduler};
pub use infrastructure::hyperliquid::{HyperliquidCodec, WebSocketTransport};
pub use infrastructure::config::{ConfigError, FeedConfig};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
