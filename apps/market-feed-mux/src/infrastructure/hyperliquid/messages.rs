//! Hyperliquid WebSocket Message Types
//!
//! Wire format types for the Hyperliquid info WebSocket. These map directly
//! to the JSON the exchange sends and expects; the codec converts them to
//! and from domain frames.
//!
//! # Control Messages (client → server)
//! - `subscribe` / `unsubscribe` with a subscription object
//! - `ping`
//!
//! # Channels (server → client)
//! - `l2Book`: Order-book snapshot for one coin
//! - `trades`: Trades, possibly for several coins
//! - `allMids`: Mid prices for every coin
//! - `subscriptionResponse`: Acknowledgement of a control message
//! - `pong`: Reply to `ping`
//! - `error`: Server-side error text
//!
//! # References
//!
//! - [WebSocket API](https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/websocket)

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Channel Names
// =============================================================================

/// Order-book channel.
pub const CHANNEL_L2_BOOK: &str = "l2Book";
/// Trades channel.
pub const CHANNEL_TRADES: &str = "trades";
/// Mid-price channel.
pub const CHANNEL_ALL_MIDS: &str = "allMids";
/// Subscription acknowledgement channel.
pub const CHANNEL_SUBSCRIPTION_RESPONSE: &str = "subscriptionResponse";
/// Ping reply channel.
pub const CHANNEL_PONG: &str = "pong";
/// Server error channel.
pub const CHANNEL_ERROR: &str = "error";

// =============================================================================
// Control Messages
// =============================================================================

/// Subscription object shared by requests and acknowledgements.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "trades", "coin": "BTC"}
/// {"type": "allMids"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSubscription {
    /// Channel wire name.
    #[serde(rename = "type")]
    pub channel: String,

    /// Coin, for per-symbol channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
}

impl From<&SubscriptionKey> for WireSubscription {
    fn from(key: &SubscriptionKey) -> Self {
        Self {
            channel: key.channel_type().wire_name().to_string(),
            coin: key.symbol().map(str::to_string),
        }
    }
}

/// Control request.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "subscribe", "subscription": {"type": "l2Book", "coin": "ETH"}}
/// {"method": "ping"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlRequest {
    /// `subscribe`, `unsubscribe` or `ping`.
    pub method: &'static str,

    /// Target stream; absent for `ping`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<WireSubscription>,
}

impl ControlRequest {
    /// Subscribe request for a key.
    #[must_use]
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        Self {
            method: "subscribe",
            subscription: Some(key.into()),
        }
    }

    /// Unsubscribe request for a key.
    #[must_use]
    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        Self {
            method: "unsubscribe",
            subscription: Some(key.into()),
        }
    }

    /// Keep-alive ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            method: "ping",
            subscription: None,
        }
    }
}

// =============================================================================
// Inbound Envelope
// =============================================================================

/// Outer shape of every inbound frame.
///
/// # Wire Format (JSON)
/// ```json
/// {"channel": "trades", "data": [...]}
/// {"channel": "pong"}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Channel discriminator.
    #[serde(default)]
    pub channel: Option<String>,

    /// Channel payload, decoded per channel.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Acknowledgement payload.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "subscribe", "subscription": {"type": "trades", "coin": "BTC"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionResponse {
    /// Acknowledged method.
    pub method: String,

    /// Acknowledged stream.
    pub subscription: WireSubscription,
}

// =============================================================================
// Market Data
// =============================================================================

/// One price level.
///
/// # Wire Format (JSON)
/// ```json
/// {"px": "65000.5", "sz": "1.25", "n": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireLevel {
    /// Price.
    pub px: Decimal,
    /// Aggregate size.
    pub sz: Decimal,
    /// Number of orders.
    pub n: u32,
}

/// Order-book snapshot.
///
/// `levels` holds bids then asks, each best first.
///
/// # Wire Format (JSON)
/// ```json
/// {"coin": "BTC", "time": 1700000000000, "levels": [[...bids], [...asks]]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireBook {
    /// Coin.
    pub coin: String,
    /// Exchange timestamp (ms since epoch).
    pub time: i64,
    /// Bids and asks.
    pub levels: (Vec<WireLevel>, Vec<WireLevel>),
}

/// One trade.
///
/// # Wire Format (JSON)
/// ```json
/// {"coin": "BTC", "side": "B", "px": "65000", "sz": "0.1", "time": 1700000000000,
///  "hash": "0xabc", "tid": 42}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireTrade {
    /// Coin.
    pub coin: String,
    /// Aggressor side: `B` (buy) or `A` (sell).
    pub side: String,
    /// Price.
    pub px: Decimal,
    /// Size.
    pub sz: Decimal,
    /// Exchange timestamp (ms since epoch).
    pub time: i64,
    /// Transaction hash.
    pub hash: String,
    /// Trade id.
    pub tid: u64,
}

/// Mid prices for every coin.
///
/// # Wire Format (JSON)
/// ```json
/// {"mids": {"BTC": "65000.5", "ETH": "3500.25"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireMids {
    /// Mid price per coin.
    pub mids: BTreeMap<String, Decimal>,
}

// =============================================================================
// Tests
// =============================================================================
