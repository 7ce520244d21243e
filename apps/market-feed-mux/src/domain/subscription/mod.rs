//! Subscription Registry
//!
//! Domain types for tracking which consumers want which market data streams.
//!
//! # Design
//!
//! The registry tracks:
//! - One entry per unique subscription key (channel type + symbol)
//! - The ordered set of consumer handlers registered under each key
//! - Whether a register/unregister created or removed a key, which is the
//!   only event that requires an upstream control frame
//!
//! This allows any number of consumers to share one upstream subscription.
//! The registry itself is not synchronized; the caller serializes access
//! together with the upstream frame decision it implies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

// =============================================================================
// Types
// =============================================================================

/// A symbol string (exchange coin name such as `BTC`).
pub type Symbol = String;

/// Upstream channel a subscription is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    /// Level-2 order-book snapshots.
    OrderBook,
    /// Executed trades.
    Trades,
    /// Mid prices for all symbols.
    MidPrices,
}

impl ChannelType {
    /// Get all channel types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::OrderBook, Self::Trades, Self::MidPrices]
    }

    /// Channel name used on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::OrderBook => "l2Book",
            Self::Trades => "trades",
            Self::MidPrices => "allMids",
        }
    }

    /// Parse a wire channel name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "l2Book" => Some(Self::OrderBook),
            "trades" => Some(Self::Trades),
            "allMids" => Some(Self::MidPrices),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Errors constructing a subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Channel needs a symbol but none was given.
    #[error("channel {0} requires a symbol")]
    MissingSymbol(ChannelType),

    /// Channel is global but a symbol was given.
    #[error("channel {0} does not take a symbol")]
    UnexpectedSymbol(ChannelType),

    /// Symbol was empty after trimming.
    #[error("symbol must not be empty")]
    EmptySymbol,
}

/// Identity of a logical upstream stream.
///
/// Two consumers asking for the same key share one upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// Order book for a symbol.
    OrderBook(Symbol),
    /// Trades for a symbol.
    Trades(Symbol),
    /// Global mid-price stream.
    MidPrices,
}

impl SubscriptionKey {
    /// Build a key from a channel type and optional symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the symbol is missing, empty, or given for
    /// the global mid-price channel.
    pub fn new(channel: ChannelType, symbol: Option<&str>) -> Result<Self, KeyError> {
        match (channel, symbol) {
            (ChannelType::MidPrices, None) => Ok(Self::MidPrices),
            (ChannelType::MidPrices, Some(_)) => Err(KeyError::UnexpectedSymbol(channel)),
            (_, None) => Err(KeyError::MissingSymbol(channel)),
            (channel, Some(raw)) => {
                let symbol = raw.trim();
                if symbol.is_empty() {
                    return Err(KeyError::EmptySymbol);
                }
                let symbol = symbol.to_string();
                Ok(match channel {
                    ChannelType::OrderBook => Self::OrderBook(symbol),
                    _ => Self::Trades(symbol),
                })
            }
        }
    }

    /// Order-book key for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySymbol`] for a blank symbol.
    pub fn order_book(symbol: &str) -> Result<Self, KeyError> {
        Self::new(ChannelType::OrderBook, Some(symbol))
    }

    /// Trades key for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptySymbol`] for a blank symbol.
    pub fn trades(symbol: &str) -> Result<Self, KeyError> {
        Self::new(ChannelType::Trades, Some(symbol))
    }

    /// Channel type of the key.
    #[must_use]
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::OrderBook(_) => ChannelType::OrderBook,
            Self::Trades(_) => ChannelType::Trades,
            Self::MidPrices => ChannelType::MidPrices,
        }
    }

    /// Symbol of the key, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::OrderBook(symbol) | Self::Trades(symbol) => Some(symbol),
            Self::MidPrices => None,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol() {
            Some(symbol) => write!(f, "{}:{symbol}", self.channel_type()),
            None => write!(f, "{}", self.channel_type()),
        }
    }
}

/// Identifier of a registered handler.
///
/// Ids increase monotonically per registry, so ordering by id is
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Registry Entries
// =============================================================================

/// All handlers registered under one key.
#[derive(Debug)]
pub struct SubscriptionEntry<H> {
    key: SubscriptionKey,
    handlers: BTreeMap<HandlerId, H>,
    created_at: DateTime<Utc>,
}

impl<H> SubscriptionEntry<H> {
    /// Key of the entry.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// When the key was first subscribed.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Handlers in registration order.
    pub fn handlers(&self) -> impl Iterator<Item = (HandlerId, &H)> {
        self.handlers.iter().map(|(id, handler)| (*id, handler))
    }
}

/// Outcome of registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Id assigned to the handler.
    pub handler_id: HandlerId,
    /// True if this registration created the key (0 → 1 handlers).
    pub created_key: bool,
}

/// Outcome of removing a handler.
#[derive(Debug)]
pub struct Removal<H> {
    /// The handler that was removed.
    pub handler: H,
    /// True if the key has no handlers left and was removed (1 → 0).
    pub removed_key: bool,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Map from subscription key to its registered handlers.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use market_feed_mux::domain::subscription::{SubscriptionKey, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::new();
/// let key = SubscriptionKey::trades("BTC").unwrap();
///
/// // First consumer creates the key - needs upstream subscribe
/// let first = registry.register(key.clone(), "ticker", Utc::now());
/// assert!(first.created_key);
///
/// // Second consumer shares it - no upstream change needed
/// let second = registry.register(key.clone(), "whale-detector", Utc::now());
/// assert!(!second.created_key);
///
/// // First consumer leaves - still subscribed via the second
/// let removal = registry.unregister(&key, first.handler_id).unwrap();
/// assert!(!removal.removed_key);
///
/// // Last consumer leaves - now unsubscribe upstream
/// let removal = registry.unregister(&key, second.handler_id).unwrap();
/// assert!(removal.removed_key);
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry<H>>,
    next_id: u64,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SubscriptionRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register a handler under a key.
    pub fn register(
        &mut self,
        key: SubscriptionKey,
        handler: H,
        now: DateTime<Utc>,
    ) -> Registration {
        let handler_id = HandlerId(self.next_id);
        self.next_id += 1;

        let mut created_key = false;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created_key = true;
            SubscriptionEntry {
                key,
                handlers: BTreeMap::new(),
                created_at: now,
            }
        });
        entry.handlers.insert(handler_id, handler);

        Registration {
            handler_id,
            created_key,
        }
    }

    /// Remove a handler.
    ///
    /// Returns `None` if the handler is not registered under the key.
    pub fn unregister(&mut self, key: &SubscriptionKey, id: HandlerId) -> Option<Removal<H>> {
        let entry = self.entries.get_mut(key)?;
        let handler = entry.handlers.remove(&id)?;

        let removed_key = entry.handlers.is_empty();
        if removed_key {
            self.entries.remove(key);
        }

        Some(Removal {
            handler,
            removed_key,
        })
    }

    /// Entry for a key.
    #[must_use]
    pub fn entry(&self, key: &SubscriptionKey) -> Option<&SubscriptionEntry<H>> {
        self.entries.get(key)
    }

    /// Handlers registered under a key, in registration order.
    pub fn handlers(&self, key: &SubscriptionKey) -> impl Iterator<Item = (HandlerId, &H)> {
        self.entries
            .get(key)
            .into_iter()
            .flat_map(|entry| entry.handlers())
    }

    /// Whether a key has at least one handler.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Active keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries.keys()
    }

    /// Snapshot of the active keys.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    /// Number of active keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries.values() {
            stats.active_keys += 1;
            stats.handlers += entry.handler_count();
            match entry.key.channel_type() {
                ChannelType::OrderBook => stats.order_book_keys += 1,
                ChannelType::Trades => stats.trades_keys += 1,
                ChannelType::MidPrices => stats.mid_price_keys += 1,
            }
        }
        stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of unique keys.
    pub active_keys: usize,
    /// Number of handlers across all keys.
    pub handlers: usize,
    /// Order-book keys.
    pub order_book_keys: usize,
    /// Trades keys.
    pub trades_keys: usize,
    /// Mid-price keys (zero or one).
    pub mid_price_keys: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn btc_trades() -> SubscriptionKey {
        SubscriptionKey::trades("BTC").unwrap()
    }

    #[test_case(ChannelType::OrderBook, Some("ETH") => Ok(SubscriptionKey::OrderBook("ETH".into())); "order book")]
    #[test_case(ChannelType::Trades, Some("  SOL ") => Ok(SubscriptionKey::Trades("SOL".into())); "trims symbol")]
    #[test_case(ChannelType::MidPrices, None => Ok(SubscriptionKey::MidPrices); "mid prices")]
    #[test_case(ChannelType::Trades, None => Err(KeyError::MissingSymbol(ChannelType::Trades)); "missing symbol")]
    #[test_case(ChannelType::OrderBook, Some("   ") => Err(KeyError::EmptySymbol); "blank symbol")]
    #[test_case(ChannelType::MidPrices, Some("BTC") => Err(KeyError::UnexpectedSymbol(ChannelType::MidPrices)); "extra symbol")]
    fn key_construction(
        channel: ChannelType,
        symbol: Option<&str>,
    ) -> Result<SubscriptionKey, KeyError> {
        SubscriptionKey::new(channel, symbol)
    }

    #[test]
    fn key_display_uses_wire_names() {
        assert_eq!(btc_trades().to_string(), "trades:BTC");
        assert_eq!(
            SubscriptionKey::order_book("ETH").unwrap().to_string(),
            "l2Book:ETH"
        );
        assert_eq!(SubscriptionKey::MidPrices.to_string(), "allMids");
    }

    #[test]
    fn channel_wire_names_round_trip() {
        for channel in ChannelType::all() {
            assert_eq!(ChannelType::from_wire(channel.wire_name()), Some(*channel));
        }
        assert_eq!(ChannelType::from_wire("bbo"), None);
    }

    #[test]
    fn register_new_key() {
        let mut registry = SubscriptionRegistry::new();

        let registration = registry.register(btc_trades(), (), Utc::now());

        assert!(registration.created_key);
        assert!(registry.contains(&btc_trades()));
    }

    #[test]
    fn register_existing_key() {
        let mut registry = SubscriptionRegistry::new();

        registry.register(btc_trades(), (), Utc::now());
        let second = registry.register(btc_trades(), (), Utc::now());

        assert!(!second.created_key);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entry(&btc_trades()).unwrap().handler_count(), 2);
    }

    #[test]
    fn handler_ids_are_monotonic_across_keys() {
        let mut registry = SubscriptionRegistry::new();

        let a = registry.register(btc_trades(), (), Utc::now()).handler_id;
        let b = registry
            .register(SubscriptionKey::MidPrices, (), Utc::now())
            .handler_id;
        let c = registry.register(btc_trades(), (), Utc::now()).handler_id;

        assert!(a < b && b < c);
    }

    #[test]
    fn handlers_iterate_in_registration_order() {
        let mut registry = SubscriptionRegistry::new();

        registry.register(btc_trades(), "first", Utc::now());
        registry.register(btc_trades(), "second", Utc::now());
        registry.register(btc_trades(), "third", Utc::now());

        let order: Vec<_> = registry.handlers(&btc_trades()).map(|(_, h)| *h).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn unregister_with_remaining_handlers() {
        let mut registry = SubscriptionRegistry::new();

        let first = registry.register(btc_trades(), 1, Utc::now());
        registry.register(btc_trades(), 2, Utc::now());

        let removal = registry.unregister(&btc_trades(), first.handler_id).unwrap();

        assert_eq!(removal.handler, 1);
        assert!(!removal.removed_key);
        assert!(registry.contains(&btc_trades()));
    }

    #[test]
    fn unregister_last_handler_removes_key() {
        let mut registry = SubscriptionRegistry::new();

        let only = registry.register(btc_trades(), (), Utc::now());
        let removal = registry.unregister(&btc_trades(), only.handler_id).unwrap();

        assert!(removal.removed_key);
        assert!(registry.is_empty());
        assert_eq!(registry.handlers(&btc_trades()).count(), 0);
    }

    #[test]
    fn unregister_unknown_handler_is_noop() {
        let mut registry = SubscriptionRegistry::new();

        let only = registry.register(btc_trades(), (), Utc::now());
        registry.unregister(&btc_trades(), only.handler_id);

        assert!(registry.unregister(&btc_trades(), only.handler_id).is_none());
        assert!(
            registry
                .unregister(&SubscriptionKey::MidPrices, only.handler_id)
                .is_none()
        );
    }

    #[test]
    fn recreated_key_gets_new_timestamp() {
        let mut registry = SubscriptionRegistry::new();
        let earlier = Utc::now() - chrono::Duration::seconds(60);

        let first = registry.register(btc_trades(), (), earlier);
        registry.unregister(&btc_trades(), first.handler_id);
        let now = Utc::now();
        registry.register(btc_trades(), (), now);

        assert_eq!(registry.entry(&btc_trades()).unwrap().created_at(), now);
    }

    #[test]
    fn stats_by_channel() {
        let mut registry = SubscriptionRegistry::new();

        registry.register(btc_trades(), (), Utc::now());
        registry.register(btc_trades(), (), Utc::now());
        registry.register(SubscriptionKey::trades("ETH").unwrap(), (), Utc::now());
        registry.register(SubscriptionKey::order_book("BTC").unwrap(), (), Utc::now());
        registry.register(SubscriptionKey::MidPrices, (), Utc::now());

        let stats = registry.stats();
        assert_eq!(stats.active_keys, 4);
        assert_eq!(stats.handlers, 5);
        assert_eq!(stats.trades_keys, 2);
        assert_eq!(stats.order_book_keys, 1);
        assert_eq!(stats.mid_price_keys, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize),
        Unsubscribe(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Subscribe),
            (0..3usize).prop_map(Op::Unsubscribe),
        ]
    }

    proptest! {
        /// Upstream frames derived from registry transitions alternate per
        /// key, starting with a subscribe, and the implied upstream set
        /// always mirrors the registry.
        #[test]
        fn transitions_alternate_and_mirror(ops in proptest::collection::vec(op(), 0..64)) {
            let keys = [
                btc_trades(),
                SubscriptionKey::order_book("ETH").unwrap(),
                SubscriptionKey::MidPrices,
            ];
            let mut registry = SubscriptionRegistry::new();
            let mut live: HashMap<usize, Vec<HandlerId>> = HashMap::new();
            let mut upstream: BTreeSet<SubscriptionKey> = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Subscribe(k) => {
                        let registration = registry.register(keys[k].clone(), (), Utc::now());
                        live.entry(k).or_default().push(registration.handler_id);
                        if registration.created_key {
                            prop_assert!(upstream.insert(keys[k].clone()));
                        }
                    }
                    Op::Unsubscribe(k) => {
                        let Some(id) = live.get_mut(&k).and_then(Vec::pop) else {
                            continue;
                        };
                        let removal = registry.unregister(&keys[k], id).unwrap();
                        if removal.removed_key {
                            prop_assert!(upstream.remove(&keys[k]));
                        }
                    }
                }

                let registered: BTreeSet<_> = registry.keys().cloned().collect();
                prop_assert_eq!(&registered, &upstream);
            }
        }
    }
}
