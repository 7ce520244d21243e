//! Feed Configuration Settings
//!
//! Configuration types for the feed service, loaded from environment
//! variables. Loading goes through a lookup function so tests can supply
//! values without touching the process environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::application::services::{
    HealthConfig, HeartbeatConfig, ManagerConfig, ReconnectConfig, SupervisorConfig,
    ThrottleConfig,
};
use crate::infrastructure::hyperliquid::{DEFAULT_CONNECT_TIMEOUT, MAINNET_URL};

/// Upstream endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            url: MAINNET_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Application-level ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Silence before the connection is reported degraded.
    pub degraded_after: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Fraction of the delay added as random jitter.
    pub reconnect_jitter_factor: f64,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        let heartbeat = HeartbeatConfig::default();
        let reconnect = ReconnectConfig::default();
        Self {
            heartbeat_interval: heartbeat.ping_interval,
            heartbeat_timeout: heartbeat.silence_timeout,
            degraded_after: heartbeat.degraded_after,
            reconnect_delay_initial: reconnect.initial_delay,
            reconnect_delay_max: reconnect.max_delay,
            reconnect_delay_multiplier: reconnect.multiplier,
            reconnect_jitter_factor: reconnect.jitter_factor,
            max_reconnect_attempts: reconnect.max_attempts,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

impl ServerSettings {
    /// Address the health endpoint listens on (all interfaces).
    #[must_use]
    pub fn health_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.health_port))
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Upstream endpoint.
    pub endpoint: EndpointSettings,
    /// Symbols the service binary subscribes to.
    pub symbols: Vec<String>,
    /// Connect on the first subscribe.
    pub auto_connect: bool,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Default throttle windows.
    pub throttle: ThrottleConfig,
    /// Health snapshot emission interval.
    pub health_interval: Duration,
    /// Server port settings.
    pub server: ServerSettings,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointSettings::default(),
            symbols: vec!["BTC".to_string(), "ETH".to_string()],
            auto_connect: true,
            websocket: WebSocketSettings::default(),
            throttle: ThrottleConfig::default(),
            health_interval: HealthConfig::default().interval,
            server: ServerSettings::default(),
        }
    }
}

impl FeedConfig {
    /// Create configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from a `.env` file, ignoring the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// endpoint URL is invalid.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let values = dotenvy::from_path_iter(path.as_ref())?
            .collect::<Result<HashMap<String, String>, _>>()?;
        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Missing or unparseable numeric values fall back to defaults, as do
    /// zero heartbeat durations.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint URL is not a WebSocket URL.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let defaults = Self::default();

        let url = env
            .get("MARKET_FEED_WS_URL")
            .unwrap_or_else(|| defaults.endpoint.url.clone());
        validate_url(&url)?;

        let symbols = env
            .get("MARKET_FEED_SYMBOLS")
            .map_or(defaults.symbols, |list| parse_symbols(&list));

        let websocket = WebSocketSettings {
            heartbeat_interval: env.positive_secs(
                "MARKET_FEED_HEARTBEAT_INTERVAL_SECS",
                defaults.websocket.heartbeat_interval,
            ),
            heartbeat_timeout: env.positive_secs(
                "MARKET_FEED_HEARTBEAT_TIMEOUT_SECS",
                defaults.websocket.heartbeat_timeout,
            ),
            degraded_after: env.positive_secs(
                "MARKET_FEED_DEGRADED_AFTER_SECS",
                defaults.websocket.degraded_after,
            ),
            reconnect_delay_initial: env.millis(
                "MARKET_FEED_RECONNECT_DELAY_INITIAL_MS",
                defaults.websocket.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "MARKET_FEED_RECONNECT_DELAY_MAX_SECS",
                defaults.websocket.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "MARKET_FEED_RECONNECT_DELAY_MULTIPLIER",
                defaults.websocket.reconnect_delay_multiplier,
            ),
            reconnect_jitter_factor: env
                .parse(
                    "MARKET_FEED_RECONNECT_JITTER_FACTOR",
                    defaults.websocket.reconnect_jitter_factor,
                )
                .clamp(0.0, 1.0),
            max_reconnect_attempts: env.parse(
                "MARKET_FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.websocket.max_reconnect_attempts,
            ),
        };

        let throttle = ThrottleConfig {
            trades: env.millis("MARKET_FEED_THROTTLE_TRADES_MS", defaults.throttle.trades),
            order_book: env.millis(
                "MARKET_FEED_THROTTLE_ORDER_BOOK_MS",
                defaults.throttle.order_book,
            ),
            mid_prices: env.millis(
                "MARKET_FEED_THROTTLE_MID_PRICES_MS",
                defaults.throttle.mid_prices,
            ),
        };

        Ok(Self {
            endpoint: EndpointSettings {
                url,
                connect_timeout: env.secs(
                    "MARKET_FEED_CONNECT_TIMEOUT_SECS",
                    defaults.endpoint.connect_timeout,
                ),
            },
            symbols,
            auto_connect: env.parse_bool("MARKET_FEED_AUTO_CONNECT", defaults.auto_connect),
            websocket,
            throttle,
            health_interval: env.secs("MARKET_FEED_HEALTH_INTERVAL_SECS", defaults.health_interval),
            server: ServerSettings {
                health_port: env.parse("MARKET_FEED_HEALTH_PORT", defaults.server.health_port),
            },
        })
    }

    /// Manager configuration derived from these settings.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        let ws = &self.websocket;
        ManagerConfig {
            supervisor: SupervisorConfig {
                reconnect: ReconnectConfig {
                    initial_delay: ws.reconnect_delay_initial,
                    max_delay: ws.reconnect_delay_max,
                    multiplier: ws.reconnect_delay_multiplier,
                    jitter_factor: ws.reconnect_jitter_factor,
                    max_attempts: ws.max_reconnect_attempts,
                },
                heartbeat: HeartbeatConfig {
                    ping_interval: ws.heartbeat_interval,
                    degraded_after: ws.degraded_after,
                    silence_timeout: ws.heartbeat_timeout,
                },
            },
            health: HealthConfig {
                interval: self.health_interval,
                ..HealthConfig::default()
            },
            throttle: self.throttle.clone(),
            auto_connect: self.auto_connect,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Endpoint is not a WebSocket URL.
    #[error("invalid WebSocket URL {0:?}: expected ws:// or wss://")]
    InvalidUrl(String),

    /// `.env` file could not be read or parsed.
    #[error("failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.get(key) else {
            return default;
        };
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            default
        })
    }

    fn parse_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.to_lowercase()).as_deref() {
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                tracing::warn!(key, value = other, "Ignoring unparseable setting");
                default
            }
            None => default,
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn positive_secs(&self, key: &str, default: Duration) -> Duration {
        let value = self.secs(key, default);
        if value.is_zero() {
            tracing::warn!(key, "Ignoring zero duration");
            return default;
        }
        value
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.parse(key, default_ms))
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl(url.to_string()))
    }
}

fn parse_symbols(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(str::to_string)
        .collect()
}
