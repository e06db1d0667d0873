//! WebSocket transport abstraction
//!
//! [`StreamConnection`](crate::StreamConnection) only ever talks to a
//! [`Transport`], so the reconnect state machine can be driven in tests by a
//! [`MockTransport`] instead of a socket.
//!
//! # Example
//!
//! ```no_run
//! use bitvavo_ws::{Transport, TransportError, WsTransport};
//!
//! async fn example() -> Result<(), TransportError> {
//!     let mut transport = WsTransport::new("wss://ws.bitvavo.com/v2/");
//!     transport.connect().await?;
//!     transport.send(r#"{"action":"getTime"}"#).await?;
//!     if let Some(response) = transport.recv().await? {
//!         println!("Received: {}", response);
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument};

pub use crate::error::TransportError;

/// Default streaming endpoint
pub const DEFAULT_WS_URL: &str = "wss://ws.bitvavo.com/v2/";

/// A duplex text-frame connection that can be re-opened
///
/// `connect` may be called again after the connection dropped; the
/// implementation starts a fresh session each time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the endpoint
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send a text message
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive the next text message
    ///
    /// Returns `None` if the server closed the connection gracefully.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Get the endpoint URL
    fn endpoint(&self) -> &str;
}

/// WebSocket transport using tokio-tungstenite
pub struct WsTransport {
    url: String,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    connect_timeout: Duration,
}

impl WsTransport {
    /// Create a transport for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&mut self) -> Result<(), TransportError> {
        // A previous session may still be half open
        self.stream = None;

        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        self.stream = Some(ws_stream);
        debug!("WebSocket connected");
        Ok(())
    }

    #[instrument(skip(self, message), fields(len = message.len()))]
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| TransportError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server sent close frame");
                    self.stream = None;
                    return Ok(None);
                }
                // tungstenite answers pings on the next read or write
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    self.stream = None;
                    return Err(TransportError::ConnectionClosed);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .close(None)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockHandle, MockTransport};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Inbound {
        Text(String),
        Close,
        Error(TransportError),
    }

    #[derive(Debug, Default)]
    struct Shared {
        sent: Mutex<Vec<String>>,
        connects: AtomicUsize,
        failing_connects: AtomicU32,
        connected: AtomicBool,
    }

    /// Channel-driven transport for tests
    ///
    /// Frames are injected through the paired [`MockHandle`] while the
    /// connection under test is running. `recv` waits until something is
    /// pushed, so a silent server can be simulated by pushing nothing.
    #[derive(Debug)]
    pub struct MockTransport {
        url: String,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        shared: Arc<Shared>,
    }

    /// Test-side control of a [`MockTransport`]
    #[derive(Debug, Clone)]
    pub struct MockHandle {
        inbound: mpsc::UnboundedSender<Inbound>,
        shared: Arc<Shared>,
    }

    impl MockTransport {
        /// Create a transport and its handle
        pub fn new(url: impl Into<String>) -> (Self, MockHandle) {
            let (tx, rx) = mpsc::unbounded_channel();
            let shared = Arc::new(Shared::default());
            let transport = Self {
                url: url.into(),
                inbound: rx,
                shared: Arc::clone(&shared),
            };
            (transport, MockHandle { inbound: tx, shared })
        }
    }

    impl MockHandle {
        /// Deliver a text frame
        pub fn push_text(&self, text: impl Into<String>) {
            let _ = self.inbound.send(Inbound::Text(text.into()));
        }

        /// Deliver a JSON frame
        pub fn push_json(&self, value: serde_json::Value) {
            self.push_text(value.to_string());
        }

        /// Close the connection from the server side
        pub fn push_close(&self) {
            let _ = self.inbound.send(Inbound::Close);
        }

        /// Fail the next `recv` with an error
        pub fn push_error(&self, error: TransportError) {
            let _ = self.inbound.send(Inbound::Error(error));
        }

        /// Make the next `n` connection attempts fail
        pub fn fail_next_connects(&self, n: u32) {
            self.shared.failing_connects.store(n, Ordering::SeqCst);
        }

        /// Messages sent by the client so far
        pub fn sent(&self) -> Vec<String> {
            self.shared.sent.lock().clone()
        }

        /// Messages sent by the client, clearing the record
        pub fn take_sent(&self) -> Vec<String> {
            std::mem::take(&mut *self.shared.sent.lock())
        }

        /// Number of successful and failed `connect` calls
        pub fn connect_count(&self) -> usize {
            self.shared.connects.load(Ordering::SeqCst)
        }

        /// Check if the client side is connected
        pub fn is_connected(&self) -> bool {
            self.shared.connected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            let failing = self.shared.failing_connects.load(Ordering::SeqCst);
            if failing > 0 {
                self.shared.failing_connects.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::ConnectionFailed("mock connection failure".into()));
            }
            self.shared.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&mut self, message: &str) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.shared.sent.lock().push(message.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, TransportError> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            match self.inbound.recv().await {
                Some(Inbound::Text(text)) => Ok(Some(text)),
                Some(Inbound::Close) => {
                    self.shared.connected.store(false, Ordering::SeqCst);
                    Ok(None)
                }
                Some(Inbound::Error(error)) => {
                    self.shared.connected.store(false, Ordering::SeqCst);
                    Err(error)
                }
                None => {
                    self.shared.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::ConnectionClosed)
                }
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.shared.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.shared.connected.load(Ordering::SeqCst)
        }

        fn endpoint(&self) -> &str {
            &self.url
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_send_recv() {
        let (mut transport, handle) = MockTransport::new("wss://mock.test");
        handle.push_text(r#"{"event":"subscribed"}"#);

        transport.connect().await.unwrap();
        assert!(handle.is_connected());

        transport.send(r#"{"action":"subscribe"}"#).await.unwrap();
        assert_eq!(handle.sent().len(), 1);

        let response = transport.recv().await.unwrap();
        assert!(response.unwrap().contains("subscribed"));
    }

    #[tokio::test]
    async fn test_mock_transport_connection_failure() {
        let (mut transport, handle) = MockTransport::new("wss://mock.test");
        handle.fail_next_connects(1);

        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
        assert!(transport.connect().await.is_ok());
        assert_eq!(handle.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_close_and_reconnect() {
        let (mut transport, handle) = MockTransport::new("wss://mock.test");
        handle.push_close();
        handle.push_text("after");

        transport.connect().await.unwrap();
        assert!(transport.recv().await.unwrap().is_none());
        assert!(matches!(transport.recv().await, Err(TransportError::NotConnected)));

        transport.connect().await.unwrap();
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (mut transport, _handle) = MockTransport::new("wss://mock.test");
        assert_eq!(
            transport.send("x").await,
            Err(TransportError::NotConnected)
        );
    }
}
