//! Configuration Module
//!
//! Configuration loading for the feed service.

mod settings;

pub use settings::{ConfigError, EndpointSettings, FeedConfig, ServerSettings, WebSocketSettings};
