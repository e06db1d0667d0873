//! Stream connection and orderbook synchronizer working together
//!
//! Uses MockTransport and paused tokio time; no network access.

use async_trait::async_trait;
use bitvavo_book::BookError;
use bitvavo_types::{BookData, Channel, Level};
use bitvavo_ws::{
    BookEvent, ConnectionState, MockHandle, MockTransport, OrderBookSynchronizer,
    ReconnectConfig, SnapshotSource, StreamConfig, StreamConnection, StreamEvent, SubscriptionKey,
    SubscriptionRegistry, SyncConfig, WsError, WsResult,
};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Snapshots(Mutex<VecDeque<BookData>>);

#[async_trait]
impl SnapshotSource for Snapshots {
    async fn fetch_snapshot(&self, market: &str) -> WsResult<BookData> {
        self.0.lock().pop_front().ok_or_else(|| WsError::Snapshot {
            market: market.to_string(),
            message: "exhausted".into(),
        })
    }
}

fn snapshot(nonce: u64) -> BookData {
    BookData {
        market: "BTC-EUR".into(),
        nonce,
        bids: vec![Level::new(dec!(30000), dec!(1))],
        asks: vec![Level::new(dec!(30010), dec!(1))],
    }
}

fn push_delta(handle: &MockHandle, nonce: u64, bid: &str, size: &str) {
    handle.push_json(json!({
        "event": "book",
        "market": "BTC-EUR",
        "nonce": nonce,
        "bids": [[bid, size]],
        "asks": []
    }));
}

async fn expect<E: std::fmt::Debug>(
    events: &mut UnboundedReceiver<E>,
    pred: impl Fn(&E) -> bool,
) -> E {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn connected(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::StateChanged {
            to: ConnectionState::Connected,
            ..
        }
    )
}

#[tokio::test(start_paused = true)]
async fn book_resyncs_after_reconnect_and_after_gap() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let source = Arc::new(Snapshots(Mutex::new(
        vec![snapshot(100), snapshot(200), snapshot(300)].into(),
    )));

    let sync = Arc::new(OrderBookSynchronizer::new(
        "BTC-EUR",
        source,
        SyncConfig::default(),
    ));
    let mut book_events = sync.take_event_receiver().unwrap();
    let sync_task = sync.attach(&registry);

    let (transport, handle) = MockTransport::new("wss://mock.test");
    let config = StreamConfig::new()
        .with_heartbeat_timeout(None)
        .with_reconnect(ReconnectConfig::new().with_jitter(0.0));
    let conn = Arc::new(StreamConnection::new(
        config,
        Arc::clone(&registry),
        Box::new(transport),
    ));
    let mut stream_events = conn.take_event_receiver().unwrap();
    let conn_task = conn.start();

    expect(&mut stream_events, connected).await;
    expect(&mut book_events, |e| matches!(e, BookEvent::Synced { sequence: 100, .. })).await;

    push_delta(&handle, 101, "30001", "2");
    tokio::time::timeout(Duration::from_secs(5), async {
        while sync.sequence() != Some(101) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sync.book().unwrap().best_bid().unwrap().price, dec!(30001));

    // Server drops us; the pre-disconnect book must not be served as current
    handle.push_close();
    expect(&mut book_events, |e| matches!(e, BookEvent::Interrupted { .. })).await;
    assert_eq!(
        sync.book(),
        Err(BookError::NotSynced {
            market: "BTC-EUR".into()
        })
    );

    // Quiet market: no deltas at all, yet the book comes back from a fresh snapshot
    expect(&mut stream_events, connected).await;
    assert!(conn
        .active_subscriptions()
        .contains(&SubscriptionKey::new(Channel::Book, "BTC-EUR")));
    expect(&mut book_events, |e| matches!(e, BookEvent::Synced { sequence: 200, .. })).await;
    assert_eq!(sync.book().unwrap().sequence, 200);

    push_delta(&handle, 250, "30002", "1");
    let gap = expect(&mut book_events, |e| matches!(e, BookEvent::GapDetected { .. })).await;
    assert_eq!(
        gap,
        BookEvent::GapDetected {
            market: "BTC-EUR".into(),
            expected: 201,
            received: 250
        }
    );
    expect(&mut book_events, |e| matches!(e, BookEvent::Synced { sequence: 300, .. })).await;
    assert_eq!(sync.book().unwrap().sequence, 300);

    conn.stop();
    sync.stop();
    assert!(conn_task.await.unwrap().is_ok());
    sync_task.await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_market_is_not_restored() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let _btc = registry.subscribe(Channel::Ticker, "BTC-EUR");
    let _eth = registry.subscribe(Channel::Ticker, "ETH-EUR");

    let (transport, handle) = MockTransport::new("wss://mock.test");
    let config = StreamConfig::new()
        .with_heartbeat_timeout(None)
        .with_reconnect(ReconnectConfig::new().with_jitter(0.0));
    let conn = Arc::new(StreamConnection::new(
        config,
        Arc::clone(&registry),
        Box::new(transport),
    ));
    let mut events = conn.take_event_receiver().unwrap();
    let task = conn.start();
    expect(&mut events, connected).await;

    handle.push_close();
    expect(&mut events, |e| matches!(e, StreamEvent::Disconnected { .. })).await;
    registry.remove(Channel::Ticker, "ETH-EUR");
    handle.take_sent();

    let restored = expect(&mut events, |e| matches!(e, StreamEvent::SubscriptionsRestored { .. })).await;
    assert_eq!(restored, StreamEvent::SubscriptionsRestored { count: 1 });
    let sent = handle.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("BTC-EUR"));
    assert!(!sent[0].contains("ETH-EUR"));

    conn.stop();
    task.await.unwrap().unwrap();
}
