//! Hyperliquid WebSocket Adapters
//!
//! Implements the upstream side of the feed against Hyperliquid's info
//! stream:
//!
//! - **Messages**: Wire types for control requests and channel payloads
//! - **Codec**: JSON translation to and from domain frames
//! - **WebSocket**: `tokio-tungstenite` transport

pub mod codec;
pub mod messages;
pub mod websocket;

pub use codec::HyperliquidCodec;
pub use messages::{ControlRequest, Envelope, WireSubscription};
pub use websocket::{DEFAULT_CONNECT_TIMEOUT, MAINNET_URL, TESTNET_URL, WebSocketTransport};
