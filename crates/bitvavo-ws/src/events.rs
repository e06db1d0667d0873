//! Connection and orderbook events

use crate::connection::ConnectionState;
use std::time::Duration;

/// Reason a connection was lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server closed the connection
    ServerClosed,
    /// Connecting failed
    ConnectFailed(String),
    /// Read or write failed
    NetworkError(String),
    /// Nothing received within the heartbeat timeout
    HeartbeatTimeout,
    /// Client called `stop`
    Shutdown,
}

/// Lifecycle events of a [`StreamConnection`](crate::StreamConnection)
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// State machine moved
    StateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },
    /// Authentication handshake accepted
    Authenticated,
    /// Connection lost
    Disconnected {
        /// Why
        reason: DisconnectReason,
    },
    /// Waiting before the next connection attempt
    Reconnecting {
        /// Consecutive failure count (1-indexed)
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Every subscription in the registry was (re)sent after connecting
    SubscriptionsRestored {
        /// Number of (channel, market) pairs
        count: usize,
    },
    /// Server error frame
    ServerError {
        /// Action the error refers to
        action: Option<String>,
        /// Error code
        code: i64,
        /// Error message
        message: String,
    },
    /// The connection ended for good because of an error
    Fatal {
        /// Error description
        error: String,
    },
}

/// Events of an [`OrderBookSynchronizer`](crate::OrderBookSynchronizer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
    /// Book is consistent at `sequence`
    Synced {
        /// Market
        market: String,
        /// Sequence after snapshot and replay
        sequence: u64,
    },
    /// Stream disconnected; the book is unsynced until the subscription is restored
    Interrupted {
        /// Market
        market: String,
    },
    /// A delta skipped ahead; a resync follows
    GapDetected {
        /// Market
        market: String,
        /// Sequence the book was waiting for
        expected: u64,
        /// Sequence received
        received: u64,
    },
    /// Repeated gaps within the degradation window
    Degraded {
        /// Market
        market: String,
        /// Gaps counted within the window
        gaps: usize,
    },
    /// Snapshot fetch failed; retried after a delay
    SnapshotFailed {
        /// Market
        market: String,
        /// Failure description
        error: String,
    },
    /// Too many deltas buffered while a snapshot was in flight
    BufferOverflow {
        /// Market
        market: String,
        /// Deltas dropped
        dropped: usize,
    },
}
