//! Gap-free orderbook maintenance for one market
//!
//! The synchronizer owns an [`Orderbook`] and the book frame receiver for
//! its market. It alternates between two phases:
//!
//! - **resync**: fetch a snapshot while buffering incoming deltas, load the
//!   snapshot, replay the buffer through the normal sequence checks
//! - **stream**: apply deltas in order until a gap, then resync
//!
//! A dropped socket invalidates the book at once; the next resync starts
//! when the connection reports the subscription restored.
//!
//! Readers get either a consistent [`OrderbookSnapshot`] or
//! [`BookError::NotSynced`], never a half-applied book.

use crate::error::WsResult;
use crate::events::BookEvent;
use crate::reconnect::ReconnectConfig;
use crate::subscription::{FrameReceiver, StreamFrame, SubscriptionRegistry};

use async_trait::async_trait;
use bitvavo_book::{BookError, BookResult, DeltaOutcome, Orderbook, OrderbookSnapshot, OrderbookState};
use bitvavo_types::{BookData, Channel};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default cap on deltas buffered during a snapshot fetch
pub const DEFAULT_MAX_BUFFERED: usize = 10_000;

/// Fetches full orderbook snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Snapshot of `market`, including its sequence number
    async fn fetch_snapshot(&self, market: &str) -> WsResult<BookData>;
}

/// Synchronizer settings
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Deltas kept while a snapshot is in flight
    pub max_buffered: usize,
    /// Gaps within `degraded_window` that mark the stream degraded
    pub degraded_threshold: usize,
    /// Window for counting gaps
    pub degraded_window: Duration,
    /// Backoff after failed snapshot fetches
    pub retry: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_buffered: DEFAULT_MAX_BUFFERED,
            degraded_threshold: 3,
            degraded_window: Duration::from_secs(60),
            retry: ReconnectConfig::new()
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(10)),
        }
    }
}

impl SyncConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the buffer cap
    pub fn with_max_buffered(mut self, max: usize) -> Self {
        self.max_buffered = max;
        self
    }

    /// Set the degradation threshold and window
    pub fn with_degraded_after(mut self, gaps: usize, window: Duration) -> Self {
        self.degraded_threshold = gaps.max(1);
        self.degraded_window = window;
        self
    }

    /// Set snapshot retry backoff
    pub fn with_retry(mut self, retry: ReconnectConfig) -> Self {
        self.retry = retry;
        self
    }
}

enum Resync {
    Synced,
    Retry,
    Interrupted,
    Closed,
}

/// Keeps one market's orderbook consistent with the stream
pub struct OrderBookSynchronizer {
    market: String,
    config: SyncConfig,
    source: Arc<dyn SnapshotSource>,
    book: RwLock<Orderbook>,
    state_tx: watch::Sender<OrderbookState>,
    shutdown: CancellationToken,
    event_tx: mpsc::UnboundedSender<BookEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<BookEvent>>>,
}

impl std::fmt::Debug for OrderBookSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookSynchronizer")
            .field("market", &self.market)
            .field("state", &self.state())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl OrderBookSynchronizer {
    /// Create a synchronizer for `market`
    pub fn new(market: impl Into<String>, source: Arc<dyn SnapshotSource>, config: SyncConfig) -> Self {
        let market = market.into();
        let (state_tx, _) = watch::channel(OrderbookState::Unsynced);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            book: RwLock::new(Orderbook::new(market.clone())),
            market,
            config,
            source,
            state_tx,
            shutdown: CancellationToken::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Market of this book
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Current sync state
    pub fn state(&self) -> OrderbookState {
        *self.state_tx.borrow()
    }

    /// Check if the book is synchronized
    pub fn is_synced(&self) -> bool {
        self.state() == OrderbookState::Synced
    }

    /// Last applied sequence
    pub fn sequence(&self) -> Option<u64> {
        self.book.read().sequence()
    }

    /// Consistent copy of the book, or `NotSynced`
    pub fn book(&self) -> BookResult<OrderbookSnapshot> {
        self.book.read().snapshot()
    }

    /// Wait up to `timeout` for the book to be synchronized
    pub async fn wait_synced(&self, timeout: Duration) -> BookResult<OrderbookSnapshot> {
        let mut state = self.state_tx.subscribe();
        let synced = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == OrderbookState::Synced),
        )
        .await
        .is_ok_and(|waited| waited.is_ok());
        if !synced {
            return Err(BookError::NotSynced {
                market: self.market.clone(),
            });
        }
        self.book()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<BookEvent>> {
        self.event_rx.lock().take()
    }

    /// Subscribe to the market's book channel in `registry` and start syncing
    ///
    /// The subscription is registered before the first snapshot is
    /// requested, so no delta between the two is lost.
    pub fn attach(self: &Arc<Self>, registry: &SubscriptionRegistry) -> JoinHandle<()> {
        let frames = registry.subscribe(Channel::Book, self.market.clone());
        self.start(frames)
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn start(self: &Arc<Self>, frames: FrameReceiver) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(frames).await })
    }

    /// Stop synchronizing
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Consume `frames` until stopped or the sender side goes away
    #[instrument(skip(self, frames), fields(market = %self.market))]
    pub async fn run(&self, mut frames: FrameReceiver) {
        let mut gaps: VecDeque<Instant> = VecDeque::new();
        let mut failures = 0u32;
        let mut interrupted = false;

        loop {
            if interrupted {
                if !self.wait_restored(&mut frames).await {
                    break;
                }
                interrupted = false;
            }

            match self.resync(&mut frames, &mut failures, &mut gaps).await {
                Resync::Closed => break,
                Resync::Retry => continue,
                Resync::Interrupted => {
                    interrupted = true;
                    continue;
                }
                Resync::Synced => {}
            }

            loop {
                let frame = tokio::select! {
                    () = self.shutdown.cancelled() => return self.finish(),
                    frame = frames.recv() => frame,
                };
                let delta = match frame {
                    None => return self.finish(),
                    Some(StreamFrame::Book(delta)) => delta,
                    Some(StreamFrame::Interrupted { .. }) => {
                        self.interrupt();
                        interrupted = true;
                        break;
                    }
                    Some(_) => continue,
                };

                let outcome = self.book.write().apply_delta(&delta);
                match outcome {
                    DeltaOutcome::Applied => {}
                    DeltaOutcome::Stale => {
                        debug!(nonce = delta.nonce, "Discarding stale delta");
                    }
                    DeltaOutcome::Gap { expected, received } => {
                        self.state_tx.send_replace(OrderbookState::Unsynced);
                        self.record_gap(expected, received, &mut gaps);
                        break;
                    }
                    DeltaOutcome::NotSynced => {
                        self.state_tx.send_replace(OrderbookState::Unsynced);
                        break;
                    }
                }
            }
        }
        self.finish();
    }

    /// Drop frames until the book subscription is live again
    async fn wait_restored(&self, frames: &mut FrameReceiver) -> bool {
        loop {
            let frame = tokio::select! {
                () = self.shutdown.cancelled() => return false,
                frame = frames.recv() => frame,
            };
            match frame {
                Some(StreamFrame::Restored { .. }) => {
                    debug!("Subscription restored, resynchronizing");
                    return true;
                }
                Some(_) => {}
                None => return false,
            }
        }
    }

    fn interrupt(&self) {
        self.book.write().invalidate();
        self.state_tx.send_replace(OrderbookState::Unsynced);
        info!("Stream interrupted, orderbook unsynced until resubscribed");
        self.emit(BookEvent::Interrupted {
            market: self.market.clone(),
        });
    }

    /// Fetch a snapshot, buffering deltas meanwhile, then replay the buffer
    async fn resync(
        &self,
        frames: &mut FrameReceiver,
        failures: &mut u32,
        gaps: &mut VecDeque<Instant>,
    ) -> Resync {
        debug!("Requesting snapshot");
        let fetch = self.source.fetch_snapshot(&self.market);
        tokio::pin!(fetch);

        let mut buffer: Vec<BookData> = Vec::new();
        let mut dropped = 0usize;

        let fetched = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Resync::Closed,
                result = &mut fetch => break result,
                frame = frames.recv() => match frame {
                    Some(StreamFrame::Book(delta)) => {
                        if dropped > 0 || buffer.len() >= self.config.max_buffered {
                            dropped += buffer.len() + 1;
                            buffer.clear();
                        } else {
                            buffer.push(delta);
                        }
                    }
                    Some(StreamFrame::Interrupted { .. }) => {
                        self.interrupt();
                        return Resync::Interrupted;
                    }
                    Some(_) => {}
                    None => return Resync::Closed,
                },
            }
        };

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                *failures += 1;
                let delay = self.config.retry.delay_with_jitter(*failures);
                warn!(error = %e, attempt = *failures, delay_ms = delay.as_millis() as u64, "Snapshot fetch failed");
                self.emit(BookEvent::SnapshotFailed {
                    market: self.market.clone(),
                    error: e.to_string(),
                });
                tokio::select! {
                    () = tokio::time::sleep(delay) => return Resync::Retry,
                    () = self.shutdown.cancelled() => return Resync::Closed,
                }
            }
        };
        *failures = 0;

        if dropped > 0 {
            warn!(dropped, max = self.config.max_buffered, "Delta buffer overflowed during snapshot, refetching");
            self.emit(BookEvent::BufferOverflow {
                market: self.market.clone(),
                dropped,
            });
            return Resync::Retry;
        }

        let replayed = {
            let mut book = self.book.write();
            book.apply_snapshot(&snapshot);
            let mut outcome = Ok(());
            for delta in &buffer {
                match book.apply_delta(delta) {
                    DeltaOutcome::Applied | DeltaOutcome::Stale => {}
                    DeltaOutcome::Gap { expected, received } => {
                        outcome = Err((expected, received));
                        break;
                    }
                    DeltaOutcome::NotSynced => {
                        outcome = Err((snapshot.nonce + 1, delta.nonce));
                        break;
                    }
                }
            }
            outcome.map(|()| book.sequence().unwrap_or(snapshot.nonce))
        };

        match replayed {
            Ok(sequence) => {
                self.state_tx.send_replace(OrderbookState::Synced);
                info!(sequence, buffered = buffer.len(), "Orderbook synchronized");
                self.emit(BookEvent::Synced {
                    market: self.market.clone(),
                    sequence,
                });
                Resync::Synced
            }
            Err((expected, received)) => {
                self.record_gap(expected, received, gaps);
                Resync::Retry
            }
        }
    }

    fn record_gap(&self, expected: u64, received: u64, gaps: &mut VecDeque<Instant>) {
        warn!(expected, received, "Sequence gap, resynchronizing");
        self.emit(BookEvent::GapDetected {
            market: self.market.clone(),
            expected,
            received,
        });

        let now = Instant::now();
        gaps.push_back(now);
        while gaps
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.config.degraded_window)
        {
            gaps.pop_front();
        }
        if gaps.len() >= self.config.degraded_threshold {
            warn!(gaps = gaps.len(), "Orderbook stream degraded");
            self.emit(BookEvent::Degraded {
                market: self.market.clone(),
                gaps: gaps.len(),
            });
        }
    }

    fn finish(&self) {
        self.book.write().invalidate();
        self.state_tx.send_replace(OrderbookState::Unsynced);
        debug!("Synchronizer stopped");
    }

    fn emit(&self, event: BookEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WsError;
    use bitvavo_types::Level;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        delay: Duration,
        replies: Mutex<VecDeque<WsResult<BookData>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(delay: Duration, replies: Vec<WsResult<BookData>>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self, market: &str) -> WsResult<BookData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.replies.lock().pop_front().unwrap_or_else(|| {
                Err(WsError::Snapshot {
                    market: market.to_string(),
                    message: "no more snapshots".into(),
                })
            })
        }
    }

    fn data(nonce: u64, bids: Vec<Level>, asks: Vec<Level>) -> BookData {
        BookData {
            market: "BTC-EUR".into(),
            nonce,
            bids,
            asks,
        }
    }

    fn snapshot(nonce: u64) -> BookData {
        data(
            nonce,
            vec![Level::new(dec!(100), dec!(1)), Level::new(dec!(99), dec!(2))],
            vec![Level::new(dec!(101), dec!(1))],
        )
    }

    fn delta(nonce: u64) -> StreamFrame {
        StreamFrame::Book(data(nonce, vec![Level::new(dec!(100), dec!(5))], vec![]))
    }

    fn synchronizer(
        source: Arc<ScriptedSource>,
        config: SyncConfig,
    ) -> (
        Arc<OrderBookSynchronizer>,
        mpsc::UnboundedSender<StreamFrame>,
        mpsc::UnboundedReceiver<BookEvent>,
    ) {
        let sync = Arc::new(OrderBookSynchronizer::new("BTC-EUR", source, config));
        let events = sync.take_event_receiver().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        sync.start(rx);
        (sync, tx, events)
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<BookEvent>,
        pred: impl Fn(&BookEvent) -> bool,
    ) -> BookEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = events.recv().await.expect("events closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not observed")
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_then_in_order_deltas() {
        let source = ScriptedSource::new(Duration::ZERO, vec![Ok(snapshot(100))]);
        let (sync, tx, _events) = synchronizer(source, SyncConfig::default());

        let book = sync.wait_synced(Duration::from_secs(5)).await.unwrap();
        assert_eq!(book.sequence, 100);
        assert_eq!(book.best_bid().unwrap().size, dec!(1));

        tx.send(delta(101)).unwrap();
        settle().await;
        let book = sync.book().unwrap();
        assert_eq!(book.sequence, 101);
        assert_eq!(book.best_bid().unwrap().size, dec!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_during_fetch_are_replayed() {
        let source = ScriptedSource::new(Duration::from_secs(1), vec![Ok(snapshot(100))]);
        let (sync, tx, mut events) = synchronizer(source, SyncConfig::default());

        for nonce in [99, 100, 101, 102] {
            tx.send(delta(nonce)).unwrap();
        }
        assert_eq!(sync.book(), Err(BookError::NotSynced { market: "BTC-EUR".into() }));

        let event = next_matching(&mut events, |e| matches!(e, BookEvent::Synced { .. })).await;
        assert_eq!(
            event,
            BookEvent::Synced {
                market: "BTC-EUR".into(),
                sequence: 102
            }
        );
        assert_eq!(sync.sequence(), Some(102));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_invalidates_until_fresh_snapshot() {
        let source = ScriptedSource::new(
            Duration::from_secs(1),
            vec![Ok(snapshot(100)), Ok(snapshot(110))],
        );
        let (sync, tx, mut events) = synchronizer(source.clone(), SyncConfig::default());
        sync.wait_synced(Duration::from_secs(5)).await.unwrap();

        tx.send(delta(101)).unwrap();
        tx.send(delta(105)).unwrap();
        let gap = next_matching(&mut events, |e| matches!(e, BookEvent::GapDetected { .. })).await;
        assert_eq!(
            gap,
            BookEvent::GapDetected {
                market: "BTC-EUR".into(),
                expected: 102,
                received: 105
            }
        );
        assert!(!sync.is_synced());
        assert!(sync.book().is_err());

        // Stale data while resyncing changes nothing
        tx.send(delta(99)).unwrap();

        let synced = next_matching(&mut events, |e| matches!(e, BookEvent::Synced { .. })).await;
        assert_eq!(
            synced,
            BookEvent::Synced {
                market: "BTC-EUR".into(),
                sequence: 110
            }
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        tx.send(delta(111)).unwrap();
        settle().await;
        assert_eq!(sync.sequence(), Some(111));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_book_unsynced_until_restored() {
        let source = ScriptedSource::new(
            Duration::ZERO,
            vec![Ok(snapshot(100)), Ok(snapshot(180))],
        );
        let (sync, tx, mut events) = synchronizer(source.clone(), SyncConfig::default());
        sync.wait_synced(Duration::from_secs(5)).await.unwrap();

        tx.send(StreamFrame::Interrupted {
            market: "BTC-EUR".into(),
        })
        .unwrap();
        next_matching(&mut events, |e| matches!(e, BookEvent::Interrupted { .. })).await;
        assert_eq!(sync.book(), Err(BookError::NotSynced { market: "BTC-EUR".into() }));

        // Nothing is fetched while the socket is down
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!sync.is_synced());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tx.send(StreamFrame::Restored {
            market: "BTC-EUR".into(),
        })
        .unwrap();
        let book = sync.wait_synced(Duration::from_secs(5)).await.unwrap();
        assert_eq!(book.sequence, 180);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_without_interruption_keeps_book() {
        let source = ScriptedSource::new(Duration::ZERO, vec![Ok(snapshot(100))]);
        let (sync, tx, _events) = synchronizer(source.clone(), SyncConfig::default());
        sync.wait_synced(Duration::from_secs(5)).await.unwrap();

        tx.send(StreamFrame::Restored {
            market: "BTC-EUR".into(),
        })
        .unwrap();
        tx.send(delta(101)).unwrap();
        settle().await;
        assert_eq!(sync.book().unwrap().sequence, 101);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_gaps_report_degraded() {
        let source = ScriptedSource::new(
            Duration::ZERO,
            vec![Ok(snapshot(1)), Ok(snapshot(10)), Ok(snapshot(20))],
        );
        let config = SyncConfig::default().with_degraded_after(2, Duration::from_secs(60));
        let (sync, tx, mut events) = synchronizer(source, config);

        sync.wait_synced(Duration::from_secs(5)).await.unwrap();
        tx.send(delta(5)).unwrap();
        next_matching(&mut events, |e| matches!(e, BookEvent::Synced { sequence: 10, .. })).await;
        tx.send(delta(15)).unwrap();

        let degraded = next_matching(&mut events, |e| matches!(e, BookEvent::Degraded { .. })).await;
        assert_eq!(
            degraded,
            BookEvent::Degraded {
                market: "BTC-EUR".into(),
                gaps: 2
            }
        );
        next_matching(&mut events, |e| matches!(e, BookEvent::Synced { sequence: 20, .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshot_retried() {
        let source = ScriptedSource::new(
            Duration::ZERO,
            vec![
                Err(WsError::Snapshot {
                    market: "BTC-EUR".into(),
                    message: "HTTP 503".into(),
                }),
                Ok(snapshot(7)),
            ],
        );
        let (sync, _tx, mut events) = synchronizer(source, SyncConfig::default());

        next_matching(&mut events, |e| matches!(e, BookEvent::SnapshotFailed { .. })).await;
        let book = sync.wait_synced(Duration::from_secs(30)).await.unwrap();
        assert_eq!(book.sequence, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_overflow_refetches() {
        let source = ScriptedSource::new(
            Duration::from_secs(1),
            vec![Ok(snapshot(100)), Ok(snapshot(200))],
        );
        let config = SyncConfig::default().with_max_buffered(2);
        let (sync, tx, mut events) = synchronizer(source, config);

        for nonce in 101..=105 {
            tx.send(delta(nonce)).unwrap();
        }

        let overflow = next_matching(&mut events, |e| matches!(e, BookEvent::BufferOverflow { .. })).await;
        assert_eq!(
            overflow,
            BookEvent::BufferOverflow {
                market: "BTC-EUR".into(),
                dropped: 5
            }
        );
        let book = sync.wait_synced(Duration::from_secs(30)).await.unwrap();
        assert_eq!(book.sequence, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_synced_times_out() {
        let source = ScriptedSource::new(Duration::from_secs(3600), vec![Ok(snapshot(1))]);
        let (sync, _tx, _events) = synchronizer(source, SyncConfig::default());

        let result = sync.wait_synced(Duration::from_secs(1)).await;
        assert_eq!(
            result,
            Err(BookError::NotSynced {
                market: "BTC-EUR".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task_and_invalidates() {
        let source = ScriptedSource::new(Duration::ZERO, vec![Ok(snapshot(1))]);
        let sync = Arc::new(OrderBookSynchronizer::new("BTC-EUR", source, SyncConfig::default()));
        let registry = SubscriptionRegistry::new();
        let task = sync.attach(&registry);
        assert!(registry.contains(Channel::Book, "BTC-EUR"));

        sync.wait_synced(Duration::from_secs(5)).await.unwrap();
        sync.stop();
        task.await.unwrap();
        assert!(sync.book().is_err());
    }
}
