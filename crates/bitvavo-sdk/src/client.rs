//! High-level Bitvavo client

use std::sync::Arc;
use std::time::Duration;

use bitvavo_auth::Credentials;
use bitvavo_book::OrderbookSnapshot;
use bitvavo_rest::{
    Clock, ClockSkewEstimator, CredentialBudget, CredentialId, HttpBackend, RateLimitManager,
    RequestDescriptor, ReqwestBackend, Response, RestTransport, SystemClock,
};
use bitvavo_types::{BookData, Channel};
use bitvavo_ws::{
    BookEvent, ConnectionState, FrameReceiver, OrderBookSynchronizer, StreamAuth,
    StreamConnection, StreamEvent, SubscriptionRegistry, Transport, WsTransport,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::snapshot::RestSnapshotSource;

struct TrackedBook {
    sync: Arc<OrderBookSynchronizer>,
    task: JoinHandle<()>,
}

/// Client for the Bitvavo REST and WebSocket APIs
///
/// Owns one rate-limited REST transport, one reconnecting stream
/// connection and any number of order book synchronizers. Everything is
/// safe to share behind an `Arc`.
///
/// # Example
///
/// ```no_run
/// use bitvavo_sdk::{BitvavoClient, ClientConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = BitvavoClient::connect(ClientConfig::from_env()?).await?;
///
///     client.track_book("BTC-EUR");
///     let book = client.wait_book("BTC-EUR", Duration::from_secs(5)).await?;
///     println!("BTC-EUR spread: {:?}", book.spread());
///
///     client.shutdown();
///     client.wait_closed().await;
///     Ok(())
/// }
/// ```
pub struct BitvavoClient {
    config: ClientConfig,
    rest: Arc<RestTransport>,
    skew: Arc<ClockSkewEstimator>,
    registry: Arc<SubscriptionRegistry>,
    stream: Arc<StreamConnection>,
    books: DashMap<String, TrackedBook>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BitvavoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitvavoClient")
            .field("rest", &self.rest)
            .field("stream_state", &self.stream.state())
            .field("books", &self.books.len())
            .finish()
    }
}

impl BitvavoClient {
    /// Create a client talking to the configured endpoints
    ///
    /// Nothing goes on the wire until [`sync_clock`](Self::sync_clock),
    /// [`start_stream`](Self::start_stream) or a request is made.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let backend = Arc::new(ReqwestBackend::new(config.request_timeout)?);
        let stream = Box::new(WsTransport::new(config.ws_url.clone()));
        Self::with_parts(config, backend, Arc::new(SystemClock), stream)
    }

    /// Create a client over explicit HTTP, clock and stream implementations
    pub fn with_parts(
        config: ClientConfig,
        backend: Arc<dyn HttpBackend>,
        clock: Arc<dyn Clock>,
        stream_transport: Box<dyn Transport>,
    ) -> ClientResult<Self> {
        config.validate()?;

        let stream_credentials: Option<Credentials> = if config.authenticate_stream {
            config.credentials.first().cloned()
        } else {
            None
        };

        let rest = Arc::new(RestTransport::new(
            config.transport_config(),
            config.credentials.clone(),
            config.rate_limit_config(),
            backend,
            Arc::clone(&clock),
        ));
        let skew = Arc::new(ClockSkewEstimator::new(config.skew_config(), clock));
        let registry = Arc::new(SubscriptionRegistry::new());

        let mut stream = StreamConnection::new(
            config.stream_config(),
            Arc::clone(&registry),
            stream_transport,
        );
        if let Some(credentials) = stream_credentials {
            let limiter = Arc::clone(rest.limiter());
            let auth = StreamAuth::new(credentials)
                .with_window(config.access_window_ms)
                .with_timestamps(move || limiter.server_now_ms());
            stream = stream.with_auth(auth);
        }

        info!(
            keys = config.credentials.len(),
            rest_url = %config.rest_url,
            ws_url = %config.ws_url,
            "Bitvavo client created"
        );

        Ok(Self {
            config,
            rest,
            skew,
            registry,
            stream: Arc::new(stream),
            books: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a client, estimate the clock offset and start the stream
    #[instrument(skip(config))]
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let client = Self::new(config)?;
        client.sync_clock().await;
        client.start_stream();
        Ok(client)
    }

    /// Get the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the REST transport
    pub fn rest(&self) -> &Arc<RestTransport> {
        &self.rest
    }

    /// Get the rate limit manager
    pub fn limiter(&self) -> &Arc<RateLimitManager> {
        self.rest.limiter()
    }

    /// Get the stream connection
    pub fn stream(&self) -> &Arc<StreamConnection> {
        &self.stream
    }

    /// Get the subscription registry
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // ========================================================================
    // REST
    // ========================================================================

    /// Send a REST request through the rate limiter
    pub async fn request(&self, request: &RequestDescriptor) -> ClientResult<Response> {
        Ok(self.rest.send(request).await?)
    }

    /// Server time in epoch ms
    pub async fn server_time(&self) -> ClientResult<i64> {
        Ok(self.rest.server_time().await?)
    }

    /// Order book snapshot over REST, using the configured depth
    pub async fn book_snapshot(&self, market: &str) -> ClientResult<BookData> {
        Ok(self.rest.book_snapshot(market, self.config.book_depth).await?)
    }

    /// Budget of one credential
    pub fn budget(&self, id: CredentialId) -> Option<CredentialBudget> {
        self.limiter().budget(id)
    }

    /// Budgets of all credentials
    pub fn budgets(&self) -> Vec<(CredentialId, CredentialBudget)> {
        self.limiter().budgets()
    }

    // ========================================================================
    // Clock
    // ========================================================================

    /// Measure the clock offset and apply it to signed timestamps
    ///
    /// Returns the offset in use afterwards (the lag override, if set).
    pub async fn sync_clock(&self) -> i64 {
        refresh_offset(&self.skew, &self.rest).await
    }

    /// Current clock offset (ms, positive when local is ahead)
    pub fn clock_offset(&self) -> i64 {
        self.limiter().clock_offset()
    }

    /// Re-estimate the clock offset every `interval` until shutdown
    pub fn spawn_skew_refresh(&self, interval: Duration) -> JoinHandle<()> {
        let skew = Arc::clone(&self.skew);
        let rest = Arc::clone(&self.rest);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        refresh_offset(&skew, &rest).await;
                    }
                }
            }
            debug!("Skew refresh stopped");
        })
    }

    // ========================================================================
    // Stream
    // ========================================================================

    /// Start the stream connection in the background
    ///
    /// Subscriptions made before or after this call are all sent.
    pub fn start_stream(&self) {
        let stream = Arc::clone(&self.stream);
        let handle = tokio::spawn(async move {
            if let Err(e) = stream.run().await {
                warn!(error = %e, "Stream connection ended with error");
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stream connection state
    pub fn state(&self) -> ConnectionState {
        self.stream.state()
    }

    /// Check if the stream is connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_connected()
    }

    /// Take the stream event receiver (can only be called once)
    pub fn stream_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.stream.take_event_receiver()
    }

    /// Subscribe to (channel, market), replacing any existing handler
    ///
    /// Book deltas for a tracked market go to its synchronizer; subscribing
    /// to the book channel of a tracked market takes them away from it.
    pub fn subscribe(&self, channel: Channel, market: impl Into<String>) -> FrameReceiver {
        self.registry.subscribe(channel, market)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, channel: Channel, market: &str) -> bool {
        self.registry.remove(channel, market)
    }

    // ========================================================================
    // Order books
    // ========================================================================

    /// Keep a local order book for `market`
    ///
    /// Subscribes to the book channel and starts a synchronizer fed by REST
    /// snapshots. Tracking an already tracked market returns the existing
    /// synchronizer.
    pub fn track_book(&self, market: impl Into<String>) -> Arc<OrderBookSynchronizer> {
        let market = market.into();
        let entry = self.books.entry(market.clone()).or_insert_with(|| {
            let source = Arc::new(RestSnapshotSource::new(
                Arc::clone(&self.rest),
                self.config.book_depth,
            ));
            let sync = Arc::new(OrderBookSynchronizer::new(
                market.clone(),
                source,
                self.config.sync.clone(),
            ));
            let task = sync.attach(&self.registry);
            info!(market = %market, "Tracking order book");
            TrackedBook { sync, task }
        });
        Arc::clone(&entry.sync)
    }

    /// Stop tracking `market`; returns false if it was not tracked
    pub fn untrack_book(&self, market: &str) -> bool {
        match self.books.remove(market) {
            Some((_, tracked)) => {
                tracked.sync.stop();
                self.registry.remove(Channel::Book, market);
                self.tasks.lock().push(tracked.task);
                info!(market, "Stopped tracking order book");
                true
            }
            None => false,
        }
    }

    /// Synchronizer for a tracked market
    pub fn synchronizer(&self, market: &str) -> Option<Arc<OrderBookSynchronizer>> {
        self.books.get(market).map(|tracked| Arc::clone(&tracked.sync))
    }

    /// Markets with a local order book
    pub fn tracked_markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
        markets.sort();
        markets
    }

    /// Consistent view of a tracked book
    pub fn book(&self, market: &str) -> ClientResult<OrderbookSnapshot> {
        let sync = self
            .synchronizer(market)
            .ok_or_else(|| ClientError::NotTracked(market.to_string()))?;
        Ok(sync.book()?)
    }

    /// Wait up to `timeout` for a tracked book to be synced
    pub async fn wait_book(&self, market: &str, timeout: Duration) -> ClientResult<OrderbookSnapshot> {
        let sync = self
            .synchronizer(market)
            .ok_or_else(|| ClientError::NotTracked(market.to_string()))?;
        Ok(sync.wait_synced(timeout).await?)
    }

    /// Take the event receiver of a tracked book (can only be called once)
    pub fn book_events(&self, market: &str) -> Option<mpsc::UnboundedReceiver<BookEvent>> {
        self.synchronizer(market)
            .and_then(|sync| sync.take_event_receiver())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop the stream, every synchronizer and the rate limiter
    ///
    /// Requests waiting for budget fail with `ShuttingDown`.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down Bitvavo client");
        self.shutdown.cancel();
        self.stream.stop();
        for tracked in self.books.iter() {
            tracked.sync.stop();
        }
        self.limiter().shutdown();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for every background task to finish after [`shutdown`](Self::shutdown)
    pub async fn wait_closed(&self) {
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let markets: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
        for market in markets {
            if let Some((_, tracked)) = self.books.remove(&market) {
                handles.push(tracked.task);
            }
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task panicked");
            }
        }
    }
}

impl Drop for BitvavoClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.stream.stop();
        for tracked in self.books.iter() {
            tracked.sync.stop();
        }
    }
}

async fn refresh_offset(skew: &ClockSkewEstimator, rest: &RestTransport) -> i64 {
    let limiter = rest.limiter();
    if let Some(offset) = limiter.config().lag_override_ms {
        debug!(offset_ms = offset, "Lag override set, skipping skew estimate");
        return offset;
    }
    let offset = skew.estimate(rest).await;
    limiter.set_clock_offset(offset);
    offset
}
