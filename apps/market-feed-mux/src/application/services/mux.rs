//! Subscription Multiplexer
//!
//! Owns the subscription registry and the outbound control queue of the
//! current session. Every registry mutation and the upstream frame it
//! implies happen under one lock, so for each key the subscribe and
//! unsubscribe frames on the ordered queue strictly alternate and the set
//! of keys upstream mirrors the registry.
//!
//! Dispatch clones the matching handlers under the lock and invokes them
//! after releasing it, so handlers may subscribe or unsubscribe
//! re-entrantly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::throttle::{Handler, Throttled};
use crate::application::ports::{Clock, Scheduler};
use crate::domain::streaming::{ControlFrame, MarketEvent};
use crate::domain::subscription::{
    HandlerId, RegistryStats, SubscriptionKey, SubscriptionRegistry,
};
use crate::infrastructure::metrics;

/// Consumer callback for market events.
pub type EventHandler = Handler<MarketEvent>;

/// Token identifying one registered handler.
///
/// Pass it back to `unsubscribe` to remove the handler.
#[must_use = "dropping the handle leaves the subscription active with no way to remove it"]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    handler_id: HandlerId,
}

impl SubscriptionHandle {
    /// Key the handler is registered under.
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Id of the handler.
    pub const fn handler_id(&self) -> HandlerId {
        self.handler_id
    }
}

#[derive(Debug)]
struct MuxState {
    registry: SubscriptionRegistry<Arc<Throttled<MarketEvent>>>,
    outbound: Option<mpsc::UnboundedSender<ControlFrame>>,
}

impl MuxState {
    /// Queue a frame on the live session, if any.
    fn send(&mut self, frame: ControlFrame) {
        let Some(tx) = &self.outbound else {
            return;
        };
        if tx.send(frame).is_err() {
            // Session ended before detaching; the next attach replays the registry.
            self.outbound = None;
        }
    }

    fn publish_stats(&self) {
        metrics::record_registry_stats(&self.registry.stats());
    }
}

/// Registry plus outbound queue.
pub struct SubscriptionMux {
    state: Mutex<MuxState>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
}

impl SubscriptionMux {
    /// Create an empty multiplexer with no live session.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            state: Mutex::new(MuxState {
                registry: SubscriptionRegistry::new(),
                outbound: None,
            }),
            clock,
            scheduler,
        }
    }

    /// Register a handler under `key`, throttled to `window`.
    ///
    /// The first handler for a key queues an upstream subscribe on the
    /// live session. Without a session the key waits for the next replay.
    pub fn subscribe(
        &self,
        key: SubscriptionKey,
        window: Duration,
        handler: EventHandler,
    ) -> SubscriptionHandle {
        let throttled = Throttled::wrap(
            handler,
            window,
            Arc::clone(&self.scheduler),
            key.to_string(),
        );

        let mut state = self.state.lock();
        let registration = state
            .registry
            .register(key.clone(), throttled, self.clock.wall_clock());
        if registration.created_key {
            tracing::debug!(key = %key, "Subscribing upstream");
            state.send(ControlFrame::Subscribe(key.clone()));
        }
        state.publish_stats();
        drop(state);

        tracing::trace!(
            key = %key,
            handler_id = %registration.handler_id,
            window_ms = window.as_millis(),
            "Handler registered"
        );

        SubscriptionHandle {
            key,
            handler_id: registration.handler_id,
        }
    }

    /// Remove a handler.
    ///
    /// The handler never fires again once this returns, including any
    /// pending throttled delivery. Removing the last handler for a key
    /// queues an upstream unsubscribe on the live session; without a
    /// session nothing is sent. Returns false if the handle was already
    /// removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut state = self.state.lock();
        let Some(removal) = state.registry.unregister(&handle.key, handle.handler_id) else {
            return false;
        };
        if removal.removed_key {
            tracing::debug!(key = %handle.key, "Unsubscribing upstream");
            state.send(ControlFrame::Unsubscribe(handle.key.clone()));
        }
        state.publish_stats();
        drop(state);

        // Outside the registry lock: this waits for a running handler,
        // which may itself be calling back into the mux.
        removal.handler.deactivate();
        true
    }

    /// Install a new session's outbound queue.
    ///
    /// Every active key is queued as a subscribe before the queue becomes
    /// visible to `subscribe`/`unsubscribe`, so the replay precedes any
    /// other frame of the session. Returns the number of keys replayed.
    pub fn attach(&self, outbound: mpsc::UnboundedSender<ControlFrame>) -> usize {
        let mut state = self.state.lock();
        let mut replayed = 0;
        for key in state.registry.keys() {
            if outbound.send(ControlFrame::Subscribe(key.clone())).is_err() {
                return replayed;
            }
            replayed += 1;
        }
        state.outbound = Some(outbound);
        replayed
    }

    /// Drop the session's outbound queue.
    pub fn detach(&self) {
        self.state.lock().outbound = None;
    }

    /// Whether a session queue is installed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state.lock().outbound.is_some()
    }

    /// Deliver an event to every handler registered under its key.
    ///
    /// Returns the number of handlers offered the event.
    pub fn dispatch(&self, event: MarketEvent) -> usize {
        let key = event.key();
        let handlers: Vec<_> = self
            .state
            .lock()
            .registry
            .handlers(&key)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            tracing::trace!(key = %key, "No handlers for event");
            return 0;
        }

        let payload = Arc::new(event);
        for handler in &handlers {
            handler.call(Arc::clone(&payload));
        }
        handlers.len()
    }

    /// Snapshot of the active keys.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.state.lock().registry.active_keys()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.state.lock().registry.stats()
    }
}

impl std::fmt::Debug for SubscriptionMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMux")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::{MidPriceMap, TradeBatch};
    use crate::infrastructure::clock::ManualClock;

    fn mux() -> (Arc<SubscriptionMux>, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let mux = Arc::new(SubscriptionMux::new(clock.clone(), clock.clone()));
        (mux, clock)
    }

    fn btc() -> SubscriptionKey {
        SubscriptionKey::trades("BTC").unwrap()
    }

    fn trades(symbol: &str) -> MarketEvent {
        MarketEvent::Trades(TradeBatch {
            symbol: symbol.to_string(),
            trades: vec![],
        })
    }

    fn noop() -> EventHandler {
        Arc::new(|_: &MarketEvent| {})
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        Arc::new(move |_: &MarketEvent| log.lock().push(name))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ControlFrame>) -> Vec<ControlFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn shared_key_sends_one_subscribe() {
        let (mux, _clock) = mux();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.attach(tx);

        let _a = mux.subscribe(btc(), Duration::ZERO, noop());
        let _b = mux.subscribe(btc(), Duration::ZERO, noop());
        let _c = mux.subscribe(btc(), Duration::ZERO, noop());

        assert_eq!(drain(&mut rx), vec![ControlFrame::Subscribe(btc())]);
    }

    #[test]
    fn last_unsubscribe_sends_one_unsubscribe() {
        let (mux, _clock) = mux();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.attach(tx);

        let a = mux.subscribe(btc(), Duration::ZERO, noop());
        let b = mux.subscribe(btc(), Duration::ZERO, noop());
        drain(&mut rx);

        assert!(mux.unsubscribe(&a));
        assert!(drain(&mut rx).is_empty());
        assert!(mux.unsubscribe(&b));
        assert_eq!(drain(&mut rx), vec![ControlFrame::Unsubscribe(btc())]);
        assert!(!mux.unsubscribe(&b));
    }

    #[test]
    fn detached_subscribe_is_replayed_on_attach() {
        let (mux, _clock) = mux();

        let _a = mux.subscribe(btc(), Duration::ZERO, noop());
        let _b = mux.subscribe(SubscriptionKey::MidPrices, Duration::ZERO, noop());

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(mux.attach(tx), 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                ControlFrame::Subscribe(btc()),
                ControlFrame::Subscribe(SubscriptionKey::MidPrices),
            ]
        );
    }

    #[test]
    fn detached_unsubscribe_cancels_pending_subscribe() {
        let (mux, _clock) = mux();

        let handle = mux.subscribe(btc(), Duration::ZERO, noop());
        mux.unsubscribe(&handle);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(mux.attach(tx), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn closed_queue_is_detached() {
        let (mux, _clock) = mux();
        let (tx, rx) = mpsc::unbounded_channel();
        mux.attach(tx);
        drop(rx);

        let _handle = mux.subscribe(btc(), Duration::ZERO, noop());

        assert!(!mux.is_attached());
        assert_eq!(mux.active_keys(), vec![btc()]);
    }

    #[test]
    fn dispatch_routes_by_key_in_order() {
        let (mux, _clock) = mux();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _first = mux.subscribe(btc(), Duration::ZERO, recorder(&log, "first"));
        let _other = mux.subscribe(
            SubscriptionKey::trades("ETH").unwrap(),
            Duration::ZERO,
            recorder(&log, "eth"),
        );
        let _second = mux.subscribe(btc(), Duration::ZERO, recorder(&log, "second"));

        assert_eq!(mux.dispatch(trades("BTC")), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(
            mux.dispatch(MarketEvent::MidPrices(MidPriceMap::default())),
            0
        );
    }

    #[test]
    fn panicking_handler_does_not_block_siblings() {
        let (mux, _clock) = mux();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _bad = mux.subscribe(
            btc(),
            Duration::ZERO,
            Arc::new(|event: &MarketEvent| {
                assert!(event.as_trades().is_none(), "handler failure");
            }),
        );
        let _good = mux.subscribe(btc(), Duration::ZERO, recorder(&log, "good"));

        mux.dispatch(trades("BTC"));
        mux.dispatch(trades("BTC"));

        assert_eq!(*log.lock(), vec!["good", "good"]);
    }

    #[test]
    fn handler_removed_mid_dispatch_does_not_fire() {
        let (mux, _clock) = mux();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let remover = {
            let mux = Arc::clone(&mux);
            let victim = Arc::clone(&victim);
            let log = Arc::clone(&log);
            Arc::new(move |_: &MarketEvent| {
                log.lock().push("remover");
                if let Some(handle) = victim.lock().take() {
                    mux.unsubscribe(&handle);
                }
            })
        };
        let _remover = mux.subscribe(btc(), Duration::ZERO, remover);
        let handle = mux.subscribe(btc(), Duration::ZERO, recorder(&log, "victim"));
        *victim.lock() = Some(handle);

        mux.dispatch(trades("BTC"));

        assert_eq!(*log.lock(), vec!["remover"]);
        assert_eq!(mux.stats().handlers, 1);
    }

    #[test]
    fn handler_may_subscribe_reentrantly() {
        let (mux, _clock) = mux();
        let added = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let mux = Arc::clone(&mux);
            let added = Arc::clone(&added);
            Arc::new(move |_: &MarketEvent| {
                let handle = mux.subscribe(SubscriptionKey::MidPrices, Duration::ZERO, noop());
                added.lock().push(handle);
            })
        };
        let _handle = mux.subscribe(btc(), Duration::ZERO, handler);

        mux.dispatch(trades("BTC"));

        assert_eq!(added.lock().len(), 1);
        assert!(mux.active_keys().contains(&SubscriptionKey::MidPrices));
    }

    #[test]
    fn throttled_handlers_share_payload_per_window() {
        let (mux, clock) = mux();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = mux.subscribe(btc(), Duration::from_millis(500), recorder(&log, "a"));
        let _b = mux.subscribe(btc(), Duration::from_millis(500), recorder(&log, "b"));

        for _ in 0..3 {
            mux.dispatch(trades("BTC"));
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(*log.lock(), vec!["a", "b"]);

        clock.advance(Duration::from_millis(300));
        assert_eq!(*log.lock(), vec!["a", "b", "a", "b"]);
    }
}
