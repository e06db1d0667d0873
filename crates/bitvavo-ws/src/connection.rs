//! Reconnecting stream session
//!
//! ```text
//! INIT ──start──▶ CONNECTING ──ok──▶ CONNECTED ──stop──▶ CLOSED
//!                   │    ▲              │
//!               fail│    │backoff       │lost / heartbeat
//!                   ▼    │              ▼
//!                  RECONNECTING ◀───────┘
//! ```
//!
//! Any state moves to CLOSED on `stop()` or a fatal error (authentication
//! rejected, reconnect attempts exhausted). CLOSED is terminal.

use crate::error::{TransportError, WsError, WsResult};
use crate::events::{DisconnectReason, StreamEvent};
use crate::reconnect::ReconnectConfig;
use crate::subscription::{FrameReceiver, StreamFrame, SubscriptionKey, SubscriptionRegistry};
use crate::transport::{Transport, WsTransport, DEFAULT_WS_URL};

use bitvavo_auth::Credentials;
use bitvavo_types::{Action, AuthenticateRequest, Channel, ControlMessage, WsMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not started
    Init,
    /// Opening the socket (and authenticating)
    Connecting,
    /// Open; subscriptions sent
    Connected,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Finished; no further transitions
    Closed,
}

/// Supplies the timestamp signed into the authentication handshake
///
/// Implemented for closures, so a skew-corrected clock can be passed as
/// `move || limiter.server_now_ms()`.
pub trait TimestampSource: Send + Sync {
    /// Timestamp in epoch ms as the server should see it
    fn timestamp_ms(&self) -> i64;
}

impl<F> TimestampSource for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn timestamp_ms(&self) -> i64 {
        self()
    }
}

/// Credentials for the authentication handshake
#[derive(Clone)]
pub struct StreamAuth {
    credentials: Credentials,
    window_ms: u64,
    timestamps: Arc<dyn TimestampSource>,
}

impl StreamAuth {
    /// Authenticate with `credentials` using the local wall clock
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            window_ms: 10_000,
            timestamps: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Set the access window
    pub fn with_window(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    /// Use a different timestamp source
    pub fn with_timestamps(mut self, source: impl TimestampSource + 'static) -> Self {
        self.timestamps = Arc::new(source);
        self
    }

    fn request(&self) -> AuthenticateRequest {
        let timestamp = self.timestamps.timestamp_ms();
        let signature = self.credentials.sign(timestamp, "GET", "/websocket", "");
        AuthenticateRequest::new(
            self.credentials.api_key(),
            signature,
            timestamp,
            self.window_ms,
        )
    }
}

impl std::fmt::Debug for StreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAuth")
            .field("credentials", &self.credentials)
            .field("window_ms", &self.window_ms)
            .finish()
    }
}

/// Configuration for a stream connection
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Reconnection settings
    pub reconnect: ReconnectConfig,
    /// Reconnect when nothing arrives for this long (None = never)
    pub heartbeat_timeout: Option<Duration>,
    /// Maximum wait for the authentication answer
    pub auth_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat_timeout: Some(Duration::from_secs(60)),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set reconnection config
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Disable automatic reconnection
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = ReconnectConfig::disabled();
        self
    }

    /// Set the heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the authentication timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }
}

/// How a single session ended
enum SessionEnd {
    Stopped,
    Lost {
        reason: DisconnectReason,
        was_connected: bool,
    },
    Fatal(WsError),
}

impl SessionEnd {
    fn lost(reason: DisconnectReason, was_connected: bool) -> Self {
        Self::Lost {
            reason,
            was_connected,
        }
    }
}

/// Reconnecting stream session driven by a [`SubscriptionRegistry`]
pub struct StreamConnection {
    config: StreamConfig,
    auth: Option<StreamAuth>,
    registry: Arc<SubscriptionRegistry>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    state: RwLock<ConnectionState>,
    /// Pairs subscribed on the current socket
    active: RwLock<BTreeSet<SubscriptionKey>>,
    shutdown: CancellationToken,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("state", &self.state())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

impl StreamConnection {
    /// Create a connection over `transport`
    pub fn new(
        config: StreamConfig,
        registry: Arc<SubscriptionRegistry>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            auth: None,
            registry,
            transport: Mutex::new(Some(transport)),
            state: RwLock::new(ConnectionState::Init),
            active: RwLock::new(BTreeSet::new()),
            shutdown: CancellationToken::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Create a connection over a real WebSocket to `config.url`
    pub fn websocket(config: StreamConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        let transport = Box::new(WsTransport::new(config.url.clone()));
        Self::new(config, registry, transport)
    }

    /// Authenticate every session before subscribing
    pub fn with_auth(mut self, auth: StreamAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The registry this connection restores from
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Pairs subscribed on the current socket (empty while not connected)
    pub fn active_subscriptions(&self) -> BTreeSet<SubscriptionKey> {
        self.active.read().clone()
    }

    /// Register interest in (channel, market) and return its frames
    pub fn subscribe(&self, channel: Channel, market: impl Into<String>) -> FrameReceiver {
        self.registry.subscribe(channel, market)
    }

    /// Drop interest in (channel, market)
    pub fn unsubscribe(&self, channel: Channel, market: &str) -> bool {
        self.registry.remove(channel, market)
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.event_rx.lock().take()
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn start(self: &Arc<Self>) -> JoinHandle<WsResult<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Stop the session; the run loop exits and never reconnects
    pub fn stop(&self) {
        info!("Stream connection stop requested");
        self.shutdown.cancel();
        if self.state() == ConnectionState::Init {
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Run the connection until `stop()` or a fatal error
    ///
    /// Returns `Ok(())` after `stop()`. Can be called once.
    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn run(&self) -> WsResult<()> {
        let mut transport = self.transport.lock().take().ok_or(WsError::AlreadyRunning)?;

        let result = self.drive(transport.as_mut()).await;

        if let Err(e) = transport.close().await {
            debug!(error = %e, "Close failed");
        }
        self.active.write().clear();
        if let Err(e) = &result {
            error!(error = %e, "Stream connection closed with error");
            self.emit(StreamEvent::Fatal {
                error: e.to_string(),
            });
        }
        self.set_state(ConnectionState::Closed);
        result
    }

    async fn drive(&self, transport: &mut dyn Transport) -> WsResult<()> {
        let mut failures = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.set_state(ConnectionState::Connecting);

            let (reason, was_connected) = match self.session(transport).await {
                SessionEnd::Stopped => return Ok(()),
                SessionEnd::Fatal(error) => return Err(error),
                SessionEnd::Lost {
                    reason,
                    was_connected,
                } => (reason, was_connected),
            };

            self.active.write().clear();
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Close after disconnect failed");
            }
            if was_connected {
                failures = 0;
                // Deltas sent while no socket was open are lost
                self.registry.notify_books(|market| StreamFrame::Interrupted {
                    market: market.to_string(),
                });
            }
            warn!(?reason, "Stream connection lost");
            self.emit(StreamEvent::Disconnected { reason });

            failures += 1;
            if !self.config.reconnect.should_reconnect(failures) {
                return Err(WsError::ReconnectExhausted { attempts: failures });
            }

            let delay = self.config.reconnect.delay_with_jitter(failures);
            self.set_state(ConnectionState::Reconnecting);
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            self.emit(StreamEvent::Reconnecting {
                attempt: failures,
                delay,
            });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One socket lifetime: connect, authenticate, restore, read
    async fn session(&self, transport: &mut dyn Transport) -> SessionEnd {
        let connected = tokio::select! {
            result = transport.connect() => result,
            () = self.shutdown.cancelled() => return SessionEnd::Stopped,
        };
        if let Err(e) = connected {
            return SessionEnd::lost(DisconnectReason::ConnectFailed(e.to_string()), false);
        }

        if let Some(auth) = &self.auth {
            if let Err(end) = self.authenticate(transport, auth).await {
                return end;
            }
        }

        // Restore the full desired set; later changes arrive through the watch
        let mut generation = self.registry.watch();
        generation.borrow_and_update();
        let desired = self.registry.keys();
        if let Err(e) = send_control(transport, Action::Subscribe, &desired).await {
            return SessionEnd::lost(DisconnectReason::NetworkError(e.to_string()), false);
        }
        let count = desired.len();
        *self.active.write() = desired;

        self.set_state(ConnectionState::Connected);
        self.emit(StreamEvent::SubscriptionsRestored { count });
        self.registry.notify_books(|market| StreamFrame::Restored {
            market: market.to_string(),
        });

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return SessionEnd::Stopped,
                changed = generation.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    generation.borrow_and_update();
                    if let Err(e) = self.sync_subscriptions(transport).await {
                        return SessionEnd::lost(DisconnectReason::NetworkError(e.to_string()), true);
                    }
                }
                frame = recv_frame(transport, self.config.heartbeat_timeout) => match frame {
                    Ok(Some(text)) => self.handle_text(&text),
                    Ok(None) => return SessionEnd::lost(DisconnectReason::ServerClosed, true),
                    Err(reason) => return SessionEnd::lost(reason, true),
                },
            }
        }
    }

    async fn authenticate(
        &self,
        transport: &mut dyn Transport,
        auth: &StreamAuth,
    ) -> Result<(), SessionEnd> {
        let json = serde_json::to_string(&auth.request())
            .map_err(|e| SessionEnd::Fatal(WsError::Serialization(e.to_string())))?;
        transport
            .send(&json)
            .await
            .map_err(|e| SessionEnd::lost(DisconnectReason::NetworkError(e.to_string()), false))?;

        let deadline = tokio::time::Instant::now() + self.config.auth_timeout;
        loop {
            let frame = tokio::select! {
                () = self.shutdown.cancelled() => return Err(SessionEnd::Stopped),
                frame = tokio::time::timeout_at(deadline, transport.recv()) => frame,
            };
            let text = match frame {
                Ok(Ok(Some(text))) => text,
                Ok(Ok(None)) => return Err(SessionEnd::lost(DisconnectReason::ServerClosed, false)),
                Ok(Err(e)) => {
                    return Err(SessionEnd::lost(
                        DisconnectReason::NetworkError(e.to_string()),
                        false,
                    ))
                }
                Err(_) => {
                    return Err(SessionEnd::lost(
                        DisconnectReason::NetworkError("authentication timed out".into()),
                        false,
                    ))
                }
            };

            match WsMessage::parse(&text) {
                Ok(WsMessage::Authenticate {
                    authenticated: true,
                }) => {
                    info!("Stream authenticated");
                    self.emit(StreamEvent::Authenticated);
                    return Ok(());
                }
                Ok(WsMessage::Authenticate {
                    authenticated: false,
                }) => {
                    return Err(SessionEnd::Fatal(WsError::AuthenticationRejected(
                        "server answered authenticated=false".into(),
                    )));
                }
                Ok(WsMessage::Error { error, .. }) => {
                    return Err(SessionEnd::Fatal(WsError::AuthenticationRejected(format!(
                        "{}: {}",
                        error.code, error.message
                    ))));
                }
                Ok(other) => self.handle_message(other),
                Err(e) => warn!(error = %e, "Failed to parse frame during handshake"),
            }
        }
    }

    /// Send the difference between the registry and what the socket has
    async fn sync_subscriptions(&self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        let desired = self.registry.keys();
        let active = self.active_subscriptions();

        let removed: BTreeSet<SubscriptionKey> = active.difference(&desired).cloned().collect();
        let added: BTreeSet<SubscriptionKey> = desired.difference(&active).cloned().collect();

        send_control(transport, Action::Unsubscribe, &removed).await?;
        send_control(transport, Action::Subscribe, &added).await?;
        if !added.is_empty() || !removed.is_empty() {
            debug!(added = added.len(), removed = removed.len(), "Subscriptions updated");
        }
        *self.active.write() = desired;
        Ok(())
    }

    fn handle_text(&self, text: &str) {
        match WsMessage::parse(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!(error = %e, "Failed to parse frame"),
        }
    }

    fn handle_message(&self, message: WsMessage) {
        match message {
            WsMessage::Book(data) => {
                self.registry.deliver(StreamFrame::Book(data));
            }
            WsMessage::Channel {
                channel,
                market,
                payload,
            } => {
                self.registry.deliver(StreamFrame::Event {
                    channel,
                    market,
                    payload,
                });
            }
            WsMessage::Subscribed(ack) => debug!(%ack, "Subscription acknowledged"),
            WsMessage::Unsubscribed(ack) => debug!(%ack, "Unsubscription acknowledged"),
            WsMessage::Error { action, error } => {
                warn!(?action, code = error.code, reason = %error.message, "Server error frame");
                self.emit(StreamEvent::ServerError {
                    action,
                    code: error.code,
                    message: error.message,
                });
            }
            WsMessage::Authenticate { authenticated } => {
                debug!(authenticated, "Unexpected authenticate answer");
            }
            WsMessage::Unknown(frame) => debug!(%frame, "Unhandled frame"),
        }
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write();
            if *state == to || *state == ConnectionState::Closed {
                return;
            }
            std::mem::replace(&mut *state, to)
        };
        debug!(?from, ?to, "Connection state changed");
        self.emit(StreamEvent::StateChanged { from, to });
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn send_control(
    transport: &mut dyn Transport,
    action: Action,
    keys: &BTreeSet<SubscriptionKey>,
) -> Result<(), TransportError> {
    let message = ControlMessage::new(action, keys.iter().map(|k| (k.channel, k.market.clone())));
    if message.is_empty() {
        return Ok(());
    }
    let json = serde_json::to_string(&message).map_err(|e| TransportError::Protocol(e.to_string()))?;
    debug!(?action, pairs = keys.len(), "Sending control message");
    transport.send(&json).await
}

async fn recv_frame(
    transport: &mut dyn Transport,
    heartbeat: Option<Duration>,
) -> Result<Option<String>, DisconnectReason> {
    let received = match heartbeat {
        Some(limit) => tokio::time::timeout(limit, transport.recv())
            .await
            .map_err(|_| DisconnectReason::HeartbeatTimeout)?,
        None => transport.recv().await,
    };
    received.map_err(|e| DisconnectReason::NetworkError(e.to_string()))
}
