//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MarketFeedManager`: Consumer-facing facade
//! - `SubscriptionMux`: Reference-counted subscription routing
//! - `ConnectionSupervisor`: Upstream lifecycle, heartbeat and reconnection
//! - `HealthMonitor`: Connection quality scoring and health listeners
//! - `Throttled`: Per-consumer leading and trailing throttle

pub mod health;
pub mod manager;
pub mod mux;
pub mod reconnect;
pub mod supervisor;
pub mod throttle;

pub use health::{HealthConfig, HealthListener, HealthListenerHandle, HealthMonitor, HealthUpdate};
pub use manager::{
    ManagerConfig, ManagerError, ManagerMetrics, MarketFeedManager, SubscribeOptions,
    ThrottleConfig,
};
pub use mux::{EventHandler, SubscriptionHandle, SubscriptionMux};
pub use reconnect::{Backoff, ReconnectConfig};
pub use supervisor::{ConnectionSupervisor, FeedCounters, HeartbeatConfig, SupervisorConfig};
pub use throttle::{Handler, Throttled};
