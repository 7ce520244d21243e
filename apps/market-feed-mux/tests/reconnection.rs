//! Connection lifecycle: replay after a drop, giving up, heartbeats and
//! explicit disconnects.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeTransport, count, manager, settle, test_config};
use market_feed_mux::{
    ConnectionQuality, ConnectionStatus, DisconnectReason, HealthSnapshot, ManagerError,
    SubscribeOptions,
};
use parking_lot::Mutex;
use tokio_stream::StreamExt;

#[tokio::test(start_paused = true)]
async fn dropped_link_replays_every_key_once() {
    let transport = FakeTransport::new();
    let manager = manager(&transport, test_config());
    manager.connect().await.unwrap();

    let _trades = manager
        .subscribe_trades("BTC", SubscribeOptions::default(), |_| {})
        .unwrap();
    let _also_trades = manager
        .subscribe_trades("BTC", SubscribeOptions::default(), |_| {})
        .unwrap();
    let _book = manager
        .subscribe_order_book("ETH", SubscribeOptions::default(), |_| {})
        .unwrap();
    settle().await;
    assert_eq!(transport.sent_on(0).len(), 2);

    transport.drop_connection(0);
    transport.wait_for_connections(2).await;
    settle().await;

    let replayed = transport.sent_on(1);
    assert_eq!(replayed.len(), 2);
    assert_eq!(count(&replayed, "subscribe", "trades", Some("BTC")), 1);
    assert_eq!(count(&replayed, "subscribe", "l2Book", Some("ETH")), 1);

    assert!(manager.connection_status());
    assert_eq!(manager.metrics().reconnects, 1);
    assert_eq!(manager.connection_state().reconnect_attempts, 0);

    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_max_attempts() {
    let transport = FakeTransport::new();
    transport.refuse_all();
    let mut config = test_config();
    config.supervisor.reconnect.max_attempts = 2;
    let manager = manager(&transport, config);

    let error = manager.connect().await.unwrap_err();

    assert_eq!(error, ManagerError::ReconnectExhausted { attempts: 3 });
    assert_eq!(transport.opens(), 3);
    assert_eq!(
        manager.health(),
        HealthSnapshot::Disconnected {
            reason: DisconnectReason::ReconnectExhausted { attempts: 3 }
        }
    );
    assert_eq!(manager.connection_quality(), ConnectionQuality::Disconnected);
    assert!(!manager.connection_status());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_opens_are_retried_until_one_succeeds() {
    let transport = FakeTransport::new();
    transport.refuse_next(2);
    let manager = manager(&transport, test_config());

    manager.connect().await.unwrap();

    assert_eq!(transport.opens(), 3);
    assert_eq!(transport.connections(), 1);
    assert!(manager.connection_status());

    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn silence_degrades_then_forces_reconnect() {
    let transport = FakeTransport::new();
    let manager = manager(&transport, test_config());

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _listener = manager.on_health(move |snapshot| sink.lock().push(snapshot.status()));

    manager.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(manager.connection_state().status, ConnectionStatus::Degraded);
    assert_eq!(manager.connection_quality(), ConnectionQuality::Poor);
    assert!(
        transport
            .sent_on(0)
            .iter()
            .any(|frame| frame["method"] == "ping")
    );

    transport.push(0, r#"{"channel":"pong"}"#);
    settle().await;
    assert_eq!(manager.connection_state().status, ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_secs(61)).await;
    transport.wait_for_connections(2).await;
    settle().await;

    assert!(manager.connection_status());
    assert_eq!(manager.metrics().reconnects, 1);

    let statuses = statuses.lock();
    assert!(statuses.contains(&ConnectionStatus::Degraded));
    assert!(statuses.contains(&ConnectionStatus::Connecting));
    assert_eq!(statuses.last(), Some(&ConnectionStatus::Connected));

    drop(statuses);
    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_subscriptions_for_the_next_connect() {
    let transport = FakeTransport::new();
    let manager = manager(&transport, test_config());
    manager.connect().await.unwrap();

    let _trades = manager
        .subscribe_trades("BTC", SubscribeOptions::default(), |_| {})
        .unwrap();
    settle().await;

    manager.disconnect();
    assert!(!manager.connection_status());
    assert_eq!(
        manager.health(),
        HealthSnapshot::Disconnected {
            reason: DisconnectReason::Requested
        }
    );

    let _mids = manager.subscribe_mid_prices(SubscribeOptions::default(), |_| {});
    settle().await;
    assert_eq!(transport.opens(), 1);

    manager.connect().await.unwrap();
    settle().await;

    let frames = transport.sent_on(1);
    assert_eq!(frames.len(), 2);
    assert_eq!(count(&frames, "subscribe", "trades", Some("BTC")), 1);
    assert_eq!(count(&frames, "subscribe", "allMids", None), 1);
    assert_eq!(manager.metrics().reconnects, 0);

    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn health_updates_start_with_current_snapshot() {
    let transport = FakeTransport::new();
    let manager = manager(&transport, test_config());
    let mut updates = manager.health_updates();

    assert_eq!(
        updates.next().await,
        Some(HealthSnapshot::Disconnected {
            reason: DisconnectReason::NeverConnected
        })
    );

    manager.connect().await.unwrap();

    let latest = updates.next().await.unwrap();
    assert_eq!(latest.status(), ConnectionStatus::Connected);

    manager.disconnect();
}
