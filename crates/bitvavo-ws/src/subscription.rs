//! Desired-state subscription registry
//!
//! The registry is the single source of truth for what a session should be
//! subscribed to. A connection re-sends the whole set every time it
//! connects, and diffs against it while connected, so callers never have
//! to care whether the socket is currently up.

use bitvavo_types::{BookData, Channel};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Frame delivered to a subscription handler
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Orderbook delta
    Book(BookData),
    /// Any other channel event, untouched
    Event {
        /// Channel
        channel: Channel,
        /// Market
        market: String,
        /// Raw frame
        payload: Value,
    },
    /// The socket carrying a book subscription went away; deltas may be missing
    Interrupted {
        /// Market
        market: String,
    },
    /// A book subscription is live again on a fresh socket
    Restored {
        /// Market
        market: String,
    },
}

impl StreamFrame {
    /// Channel carrying this frame
    pub fn channel(&self) -> Channel {
        match self {
            Self::Book(_) | Self::Interrupted { .. } | Self::Restored { .. } => Channel::Book,
            Self::Event { channel, .. } => *channel,
        }
    }

    /// Market of this frame
    pub fn market(&self) -> &str {
        match self {
            Self::Book(data) => &data.market,
            Self::Event { market, .. }
            | Self::Interrupted { market }
            | Self::Restored { market } => market,
        }
    }
}

/// Sending half of a subscription handler
///
/// Sends never block, so a slow consumer cannot stall the read loop.
pub type FrameSender = mpsc::UnboundedSender<StreamFrame>;

/// Receiving half of a subscription handler
pub type FrameReceiver = mpsc::UnboundedReceiver<StreamFrame>;

/// (channel, market) pair identifying a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    /// Channel
    pub channel: Channel,
    /// Market, e.g. `BTC-EUR`
    pub market: String,
}

impl SubscriptionKey {
    /// Create a key
    pub fn new(channel: Channel, market: impl Into<String>) -> Self {
        Self {
            channel,
            market: market.into(),
        }
    }
}

/// A registry entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// What is subscribed
    pub key: SubscriptionKey,
    /// Where frames go
    pub handler: FrameSender,
}

/// Registry of desired subscriptions
///
/// At most one handler exists per (channel, market); adding again replaces
/// the handler. Every mutation bumps a generation counter that connections
/// watch to send live subscribe/unsubscribe messages.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<SubscriptionKey, FrameSender>>,
    generation: watch::Sender<u64>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            generation,
        }
    }

    /// Register `handler` for (channel, market), returning the handler it replaced
    pub fn add(
        &self,
        channel: Channel,
        market: impl Into<String>,
        handler: FrameSender,
    ) -> Option<FrameSender> {
        let key = SubscriptionKey::new(channel, market);
        debug!(channel = %key.channel, market = %key.market, "Subscription added");
        let previous = self.entries.write().insert(key, handler);
        self.bump();
        previous
    }

    /// Register a fresh channel for (channel, market) and return its receiver
    pub fn subscribe(&self, channel: Channel, market: impl Into<String>) -> FrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(channel, market, tx);
        rx
    }

    /// Remove (channel, market); returns false if it was not registered
    pub fn remove(&self, channel: Channel, market: &str) -> bool {
        let key = SubscriptionKey::new(channel, market);
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            debug!(channel = %channel, market, "Subscription removed");
            self.bump();
        }
        removed
    }

    /// Point-in-time copy of every entry
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .iter()
            .map(|(key, handler)| Subscription {
                key: key.clone(),
                handler: handler.clone(),
            })
            .collect()
    }

    /// Point-in-time set of keys
    pub fn keys(&self) -> BTreeSet<SubscriptionKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Check if (channel, market) is registered
    pub fn contains(&self, channel: Channel, market: &str) -> bool {
        self.entries
            .read()
            .contains_key(&SubscriptionKey::new(channel, market))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Watch for mutations
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Hand a frame to its handler
    ///
    /// Returns false when nothing is registered for the frame or the
    /// handler's receiver has been dropped.
    pub fn deliver(&self, frame: StreamFrame) -> bool {
        let key = SubscriptionKey::new(frame.channel(), frame.market());
        let handler = self.entries.read().get(&key).cloned();
        match handler {
            Some(handler) => {
                if handler.send(frame).is_err() {
                    debug!(channel = %key.channel, market = %key.market, "Handler dropped its receiver");
                    return false;
                }
                true
            }
            None => {
                debug!(channel = %key.channel, market = %key.market, "No handler for frame");
                false
            }
        }
    }

    /// Send `frame(market)` to every book handler, returning how many took it
    pub fn notify_books(&self, frame: impl Fn(&str) -> StreamFrame) -> usize {
        let handlers: Vec<(String, FrameSender)> = self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.channel == Channel::Book)
            .map(|(key, handler)| (key.market.clone(), handler.clone()))
            .collect();
        handlers
            .into_iter()
            .filter(|(market, handler)| handler.send(frame(market)).is_ok())
            .count()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}
