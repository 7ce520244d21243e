//! Hyperliquid Frame Codec
//!
//! JSON codec between Hyperliquid wire frames and domain frames.
//!
//! Inbound frames are objects tagged by `channel`. A `trades` frame may mix
//! coins, so it is split into one batch per coin in order of first
//! appearance. Channels this crate does not consume decode to
//! [`InboundFrame::Ignored`] rather than an error.

use chrono::{DateTime, Utc};

use super::messages::{
    CHANNEL_ALL_MIDS, CHANNEL_ERROR, CHANNEL_L2_BOOK, CHANNEL_PONG,
    CHANNEL_SUBSCRIPTION_RESPONSE, CHANNEL_TRADES, ControlRequest, Envelope, SubscriptionResponse,
    WireBook, WireLevel, WireMids, WireTrade,
};
use crate::application::ports::{CodecError, FrameCodec};
use crate::domain::streaming::{
    AckMethod, BookLevel, ControlFrame, InboundFrame, MarketEvent, MidPriceMap,
    OrderBookSnapshot, Trade, TradeBatch, TradeSide,
};
use crate::domain::subscription::{ChannelType, SubscriptionKey};

/// JSON codec for the Hyperliquid info stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct HyperliquidCodec;

impl HyperliquidCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn decode_book(data: serde_json::Value) -> Result<InboundFrame, CodecError> {
        let book: WireBook = serde_json::from_value(data)?;
        let (bids, asks) = book.levels;
        Ok(InboundFrame::Market(MarketEvent::OrderBook(
            OrderBookSnapshot {
                symbol: book.coin,
                bids: bids.into_iter().map(level).collect(),
                asks: asks.into_iter().map(level).collect(),
                timestamp: timestamp(book.time)?,
            },
        )))
    }

    fn decode_trades(data: serde_json::Value) -> Result<Vec<InboundFrame>, CodecError> {
        let wire: Vec<WireTrade> = serde_json::from_value(data)?;
        let mut batches: Vec<TradeBatch> = Vec::new();

        for trade in wire {
            let side = match trade.side.as_str() {
                "B" => TradeSide::Buy,
                "A" => TradeSide::Sell,
                other => {
                    return Err(CodecError::InvalidValue {
                        field: "side",
                        value: other.to_string(),
                    });
                }
            };
            let decoded = Trade {
                price: trade.px,
                size: trade.sz,
                side,
                id: trade.tid,
                timestamp: timestamp(trade.time)?,
                hash: trade.hash,
            };

            match batches.iter_mut().find(|batch| batch.symbol == trade.coin) {
                Some(batch) => batch.trades.push(decoded),
                None => batches.push(TradeBatch {
                    symbol: trade.coin,
                    trades: vec![decoded],
                }),
            }
        }

        Ok(batches
            .into_iter()
            .map(|batch| InboundFrame::Market(MarketEvent::Trades(batch)))
            .collect())
    }

    fn decode_mids(data: serde_json::Value) -> Result<InboundFrame, CodecError> {
        let wire: WireMids = serde_json::from_value(data)?;
        Ok(InboundFrame::Market(MarketEvent::MidPrices(MidPriceMap {
            mids: wire.mids,
        })))
    }

    fn decode_ack(data: serde_json::Value) -> Result<InboundFrame, CodecError> {
        let response: SubscriptionResponse = serde_json::from_value(data)?;
        let method = match response.method.as_str() {
            "subscribe" => AckMethod::Subscribe,
            "unsubscribe" => AckMethod::Unsubscribe,
            other => {
                return Err(CodecError::InvalidValue {
                    field: "method",
                    value: other.to_string(),
                });
            }
        };

        // Acks for streams this crate never requests are not errors
        let Some(channel) = ChannelType::from_wire(&response.subscription.channel) else {
            return Ok(InboundFrame::Ignored(CHANNEL_SUBSCRIPTION_RESPONSE.to_string()));
        };
        let key = SubscriptionKey::new(channel, response.subscription.coin.as_deref()).map_err(
            |error| CodecError::InvalidValue {
                field: "subscription",
                value: error.to_string(),
            },
        )?;

        Ok(InboundFrame::SubscriptionAck { method, key })
    }

    fn decode_error(data: serde_json::Value) -> InboundFrame {
        match data {
            serde_json::Value::String(message) => InboundFrame::UpstreamError(message),
            other => InboundFrame::UpstreamError(other.to_string()),
        }
    }
}

impl FrameCodec for HyperliquidCodec {
    fn encode(&self, frame: &ControlFrame) -> Result<String, CodecError> {
        let request = match frame {
            ControlFrame::Subscribe(key) => ControlRequest::subscribe(key),
            ControlFrame::Unsubscribe(key) => ControlRequest::unsubscribe(key),
            ControlFrame::Ping => ControlRequest::ping(),
        };
        Ok(serde_json::to_string(&request)?)
    }

    fn decode(&self, text: &str) -> Result<Vec<InboundFrame>, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )));
        }

        let envelope: Envelope = serde_json::from_str(trimmed)?;
        let channel = envelope.channel.ok_or(CodecError::MissingChannel)?;

        match channel.as_str() {
            CHANNEL_L2_BOOK => Ok(vec![Self::decode_book(envelope.data)?]),
            CHANNEL_TRADES => Self::decode_trades(envelope.data),
            CHANNEL_ALL_MIDS => Ok(vec![Self::decode_mids(envelope.data)?]),
            CHANNEL_SUBSCRIPTION_RESPONSE => Ok(vec![Self::decode_ack(envelope.data)?]),
            CHANNEL_PONG => Ok(vec![InboundFrame::Pong]),
            CHANNEL_ERROR => Ok(vec![Self::decode_error(envelope.data)]),
            _ => Ok(vec![InboundFrame::Ignored(channel)]),
        }
    }
}

fn level(wire: WireLevel) -> BookLevel {
    BookLevel {
        price: wire.px,
        size: wire.sz,
        orders: wire.n,
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| CodecError::InvalidValue {
        field: "time",
        value: millis.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
