//! In-memory upstream for integration tests.
//!
//! Every `open` creates a connection whose outbound frames are recorded
//! and whose inbound side the test drives by hand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::sink;
use market_feed_mux::{
    HyperliquidCodec, ManagerConfig, MarketFeedManager, SystemClock, TokioScheduler, Transport,
    TransportError, TransportLink,
};
use parking_lot::Mutex;
use serde_json::Value;

struct Connection {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
}

#[derive(Default)]
struct FakeState {
    script: VecDeque<bool>,
    refuse_all: bool,
    opens: usize,
    connections: Vec<Connection>,
}

/// Scriptable in-memory transport.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `count` opens.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().script.extend(std::iter::repeat_n(false, count));
    }

    /// Refuse every open from now on.
    pub fn refuse_all(&self) {
        self.state.lock().refuse_all = true;
    }

    /// Number of `open` calls so far.
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// Number of accepted connections so far.
    pub fn connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Frames written on connection `index`, parsed as JSON.
    pub fn sent_on(&self, index: usize) -> Vec<Value> {
        let sent = Arc::clone(&self.state.lock().connections[index].sent);
        let frames = sent.lock();
        frames
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Frames written on every connection, in order.
    pub fn sent(&self) -> Vec<Value> {
        (0..self.connections()).flat_map(|index| self.sent_on(index)).collect()
    }

    /// Deliver a text frame on connection `index`.
    pub fn push(&self, index: usize, text: impl Into<String>) {
        let state = self.state.lock();
        let inbound = state.connections[index]
            .inbound
            .as_ref()
            .expect("connection already dropped");
        inbound.unbounded_send(Ok(text.into())).unwrap();
    }

    /// End the inbound stream of connection `index`, as if the peer went away.
    pub fn drop_connection(&self, index: usize) {
        self.state.lock().connections[index].inbound.take();
    }

    /// Wait until `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        while self.connections() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let mut state = self.state.lock();
        state.opens += 1;

        let accept = !state.refuse_all && state.script.pop_front().unwrap_or(true);
        if !accept {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let sent = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        state.connections.push(Connection {
            sent: Arc::clone(&sent),
            inbound: Some(inbound_tx),
        });

        let sink = sink::unfold(sent, |sent, text: String| async move {
            sent.lock().push(text);
            Ok::<_, TransportError>(sent)
        });

        Ok(TransportLink::new(sink, inbound_rx))
    }
}

/// Manager over a fake transport with tokio-backed time.
pub fn manager(transport: &Arc<FakeTransport>, config: ManagerConfig) -> MarketFeedManager {
    MarketFeedManager::new(
        config,
        Arc::clone(transport) as Arc<dyn Transport>,
        Arc::new(HyperliquidCodec::new()),
        Arc::new(SystemClock),
        Arc::new(TokioScheduler::current().unwrap()),
    )
}

/// Defaults with fast, deterministic reconnects and no auto-connect.
pub fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig {
        auto_connect: false,
        ..ManagerConfig::default()
    };
    config.supervisor.reconnect.initial_delay = Duration::from_millis(100);
    config.supervisor.reconnect.max_delay = Duration::from_secs(1);
    config.supervisor.reconnect.jitter_factor = 0.0;
    config
}

/// Let spawned tasks run without moving far in time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Count frames with the given method and subscription.
pub fn count(frames: &[Value], method: &str, channel: &str, coin: Option<&str>) -> usize {
    frames
        .iter()
        .filter(|frame| {
            frame["method"] == method
                && frame["subscription"]["type"] == channel
                && frame["subscription"]["coin"].as_str() == coin
        })
        .count()
}

/// A `trades` frame with one trade.
pub fn trades_frame(coin: &str, tid: u64) -> String {
    format!(
        r#"{{"channel":"trades","data":[{{"coin":"{coin}","side":"B","px":"100","sz":"1","time":1700000000000,"hash":"0x{tid:x}","tid":{tid}}}]}}"#
    )
}

/// An `l2Book` frame with one level per side.
pub fn book_frame(coin: &str, bid: &str, ask: &str) -> String {
    format!(
        r#"{{"channel":"l2Book","data":{{"coin":"{coin}","time":1700000000000,"levels":[[{{"px":"{bid}","sz":"1","n":1}}],[{{"px":"{ask}","sz":"1","n":1}}]]}}}}"#
    )
}
