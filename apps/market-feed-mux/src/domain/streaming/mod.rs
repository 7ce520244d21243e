//! Market Data Streaming Types
//!
//! Core domain types for market data: order-book snapshots, trade batches
//! and mid prices. These types are codec-agnostic and represent the
//! canonical internal representation handed to consumers. They are
//! immutable once decoded and shared read-only across handlers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::subscription::{ChannelType, SubscriptionKey, Symbol};

// =============================================================================
// Order Book
// =============================================================================

/// A single aggregated price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Total size resting at this price.
    pub size: Decimal,
    /// Number of orders at this price.
    pub orders: u32,
}

/// Full L2 order-book snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBookSnapshot {
    /// Symbol (coin) of the book.
    pub symbol: Symbol,
    /// Bid levels, best first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<BookLevel>,
    /// Exchange timestamp of the snapshot.
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    /// Best (highest) bid level.
    #[must_use]
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    /// Best (lowest) ask level.
    #[must_use]
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    /// Difference between best ask and best bid.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Midpoint between best bid and best ask.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        Some((self.best_ask()?.price + self.best_bid()?.price) / Decimal::TWO)
    }
}

// =============================================================================
// Trades
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Buyer was the aggressor.
    Buy,
    /// Seller was the aggressor.
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trade {
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
    /// Aggressor side.
    pub side: TradeSide,
    /// Exchange trade id.
    pub id: u64,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Transaction hash reported by the exchange.
    pub hash: String,
}

impl Trade {
    /// Price times size.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Trades for one symbol delivered in a single upstream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeBatch {
    /// Symbol (coin) the trades belong to.
    pub symbol: Symbol,
    /// Trades in exchange order.
    pub trades: Vec<Trade>,
}

impl TradeBatch {
    /// Most recent trade in the batch.
    #[must_use]
    pub fn last(&self) -> Option<&Trade> {
        self.trades.last()
    }

    /// Sum of trade notionals.
    #[must_use]
    pub fn total_notional(&self) -> Decimal {
        self.trades.iter().map(Trade::notional).sum()
    }
}

// =============================================================================
// Mid Prices
// =============================================================================

/// Mid price for every listed symbol.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MidPriceMap {
    /// Symbol to mid price.
    pub mids: BTreeMap<Symbol, Decimal>,
}

impl MidPriceMap {
    /// Mid price for a symbol.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.mids.get(symbol).copied()
    }

    /// Number of symbols in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mids.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mids.is_empty()
    }
}

// =============================================================================
// Market Event
// =============================================================================

/// A decoded market data message, routed to consumers by its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "channel", content = "data", rename_all = "camelCase")]
pub enum MarketEvent {
    /// Order-book snapshot.
    OrderBook(OrderBookSnapshot),
    /// Batch of trades for one symbol.
    Trades(TradeBatch),
    /// Global mid-price map.
    MidPrices(MidPriceMap),
}

impl MarketEvent {
    /// Channel type this event was received on.
    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::OrderBook(_) => ChannelType::OrderBook,
            Self::Trades(_) => ChannelType::Trades,
            Self::MidPrices(_) => ChannelType::MidPrices,
        }
    }

    /// Subscription key this event is delivered under.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        match self {
            Self::OrderBook(book) => SubscriptionKey::OrderBook(book.symbol.clone()),
            Self::Trades(batch) => SubscriptionKey::Trades(batch.symbol.clone()),
            Self::MidPrices(_) => SubscriptionKey::MidPrices,
        }
    }

    /// The order book, if this is an order-book event.
    #[must_use]
    pub const fn as_order_book(&self) -> Option<&OrderBookSnapshot> {
        match self {
            Self::OrderBook(book) => Some(book),
            _ => None,
        }
    }

    /// The trade batch, if this is a trades event.
    #[must_use]
    pub const fn as_trades(&self) -> Option<&TradeBatch> {
        match self {
            Self::Trades(batch) => Some(batch),
            _ => None,
        }
    }

    /// The mid-price map, if this is a mid-prices event.
    #[must_use]
    pub const fn as_mid_prices(&self) -> Option<&MidPriceMap> {
        match self {
            Self::MidPrices(mids) => Some(mids),
            _ => None,
        }
    }
}

// =============================================================================
// Control Frames
// =============================================================================

/// Outbound control message for the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlFrame {
    /// Start streaming a key.
    Subscribe(SubscriptionKey),
    /// Stop streaming a key.
    Unsubscribe(SubscriptionKey),
    /// Keep-alive ping.
    Ping,
}

impl ControlFrame {
    /// Wire method name of the frame.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
        }
    }
}

/// Which control request an upstream acknowledgement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMethod {
    /// Acknowledged a subscribe.
    Subscribe,
    /// Acknowledged an unsubscribe.
    Unsubscribe,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Market data for consumers.
    Market(MarketEvent),
    /// Upstream confirmed a subscribe or unsubscribe.
    SubscriptionAck {
        /// Request being acknowledged.
        method: AckMethod,
        /// Key the request was for.
        key: SubscriptionKey,
    },
    /// Response to a keep-alive ping.
    Pong,
    /// Upstream reported an error.
    UpstreamError(String),
    /// Frame on a channel this layer does not route.
    Ignored(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn level(price: Decimal, size: Decimal) -> BookLevel {
        BookLevel {
            price,
            size,
            orders: 1,
        }
    }

    fn book() -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTC".to_string(),
            bids: vec![level(dec!(100.0), dec!(1.5)), level(dec!(99.0), dec!(2))],
            asks: vec![level(dec!(101.0), dec!(1)), level(dec!(102.0), dec!(3))],
            timestamp: Utc::now(),
        }
    }

    fn trade(price: Decimal, size: Decimal) -> Trade {
        Trade {
            price,
            size,
            side: TradeSide::Buy,
            id: 1,
            timestamp: Utc::now(),
            hash: "0x0".to_string(),
        }
    }

    #[test]
    fn order_book_top_of_book() {
        let book = book();
        assert_eq!(book.best_bid().unwrap().price, dec!(100.0));
        assert_eq!(book.best_ask().unwrap().price, dec!(101.0));
        assert_eq!(book.spread(), Some(dec!(1.0)));
        assert_eq!(book.mid(), Some(dec!(100.5)));
    }

    #[test]
    fn empty_book_has_no_mid() {
        let book = OrderBookSnapshot {
            bids: vec![],
            ..book()
        };
        assert!(book.mid().is_none());
        assert!(book.spread().is_none());
    }

    #[test]
    fn trade_batch_notional() {
        let batch = TradeBatch {
            symbol: "ETH".to_string(),
            trades: vec![trade(dec!(2000), dec!(0.5)), trade(dec!(2001), dec!(1))],
        };
        assert_eq!(batch.total_notional(), dec!(3001));
        assert_eq!(batch.last().unwrap().price, dec!(2001));
    }

    #[test]
    fn event_keys_embed_symbol() {
        let book = MarketEvent::OrderBook(book());
        assert_eq!(book.key(), SubscriptionKey::OrderBook("BTC".to_string()));

        let trades = MarketEvent::Trades(TradeBatch {
            symbol: "ETH".to_string(),
            trades: vec![],
        });
        assert_eq!(trades.key(), SubscriptionKey::Trades("ETH".to_string()));

        let mids = MarketEvent::MidPrices(MidPriceMap::default());
        assert_eq!(mids.key(), SubscriptionKey::MidPrices);
        assert_eq!(mids.channel_type(), ChannelType::MidPrices);
    }

    #[test]
    fn event_accessors_match_variant() {
        let event = MarketEvent::OrderBook(book());
        assert!(event.as_order_book().is_some());
        assert!(event.as_trades().is_none());
        assert!(event.as_mid_prices().is_none());
    }

    #[test]
    fn control_frame_methods() {
        assert_eq!(ControlFrame::Ping.method(), "ping");
        assert_eq!(
            ControlFrame::Subscribe(SubscriptionKey::MidPrices).method(),
            "subscribe"
        );
        assert_eq!(
            ControlFrame::Unsubscribe(SubscriptionKey::MidPrices).method(),
            "unsubscribe"
        );
    }
}
