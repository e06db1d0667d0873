//! Orderbook state machine
//!
//! Tracks the book `nonce` of the last applied update and enforces the
//! sequence policy for incoming deltas.
//!
//! # State Machine
//!
//! ```text
//! Unsynced → Synced → (gap) → Unsynced → ...
//! ```
//!
//! For a delta with sequence `n` and a local sequence `s`:
//!
//! - `n <= s`: stale or duplicate, discarded without any state change
//! - `n == s + 1`: applied, local sequence becomes `n`
//! - `n > s + 1`: gap, discarded, the book becomes unsynced

use crate::storage::TreeBook;
use bitvavo_types::{BookData, Level};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Orderbook synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderbookState {
    /// No trustworthy data; waiting for a snapshot
    #[default]
    Unsynced,
    /// Processing deltas normally
    Synced,
}

/// Outcome of offering a delta to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Delta was the next in sequence and has been applied
    Applied,
    /// Delta was older than or equal to the local sequence
    Stale,
    /// Delta skipped ahead; the book is now unsynced
    Gap {
        /// Sequence the book was waiting for
        expected: u64,
        /// Sequence actually received
        received: u64,
    },
    /// Book is waiting for a snapshot and cannot take deltas
    NotSynced,
}

/// Errors returned to book readers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    /// The book is waiting for a snapshot
    #[error("orderbook for {market} is not synchronized")]
    NotSynced {
        /// Market of the book
        market: String,
    },
}

/// Result type alias for book reads
pub type BookResult<T> = Result<T, BookError>;

/// Sequence-checked orderbook for a single market
#[derive(Debug, Clone)]
pub struct Orderbook {
    market: String,
    storage: TreeBook,
    /// Nonce of the last applied snapshot or delta
    sequence: Option<u64>,
    state: OrderbookState,
}

impl Orderbook {
    /// Create a new, unsynced orderbook for a market
    pub fn new(market: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            storage: TreeBook::new(),
            sequence: None,
            state: OrderbookState::Unsynced,
        }
    }

    /// Get the market
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Get the current state
    pub fn state(&self) -> OrderbookState {
        self.state
    }

    /// Check if the orderbook is synchronized
    pub fn is_synced(&self) -> bool {
        self.state == OrderbookState::Synced
    }

    /// Sequence of the last applied snapshot or delta
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Replace the book with a snapshot and mark it synced
    pub fn apply_snapshot(&mut self, data: &BookData) {
        self.storage.load(&data.bids, &data.asks);
        self.sequence = Some(data.nonce);
        self.state = OrderbookState::Synced;
    }

    /// Offer a delta to the book
    pub fn apply_delta(&mut self, data: &BookData) -> DeltaOutcome {
        let Some(local) = self.sequence else {
            return DeltaOutcome::NotSynced;
        };

        // Stale data is harmless whatever the state
        if data.nonce <= local {
            return DeltaOutcome::Stale;
        }

        if self.state != OrderbookState::Synced {
            return DeltaOutcome::NotSynced;
        }

        let expected = local + 1;
        if data.nonce != expected {
            self.state = OrderbookState::Unsynced;
            return DeltaOutcome::Gap {
                expected,
                received: data.nonce,
            };
        }

        self.storage.apply(&data.bids, &data.asks);
        self.sequence = Some(data.nonce);
        DeltaOutcome::Applied
    }

    /// Mark the book unsynced, keeping the last sequence for stale detection
    pub fn invalidate(&mut self) {
        self.state = OrderbookState::Unsynced;
    }

    /// Clear and reset the orderbook
    pub fn reset(&mut self) {
        self.storage.clear();
        self.sequence = None;
        self.state = OrderbookState::Unsynced;
    }

    /// Capture the current state, refusing while unsynced
    pub fn snapshot(&self) -> BookResult<OrderbookSnapshot> {
        match (self.state, self.sequence) {
            (OrderbookState::Synced, Some(sequence)) => Ok(OrderbookSnapshot {
                market: self.market.clone(),
                sequence,
                bids: self.storage.bids_vec(),
                asks: self.storage.asks_vec(),
            }),
            _ => Err(BookError::NotSynced {
                market: self.market.clone(),
            }),
        }
    }

    /// Number of bid levels
    pub fn bid_count(&self) -> usize {
        self.storage.bid_count()
    }

    /// Number of ask levels
    pub fn ask_count(&self) -> usize {
        self.storage.ask_count()
    }
}

/// Immutable, internally consistent view of a synced book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    /// Market identifier
    pub market: String,
    /// Sequence the view was taken at
    pub sequence: u64,
    /// Bid levels, best first
    pub bids: Vec<Level>,
    /// Ask levels, best first
    pub asks: Vec<Level>,
}

impl OrderbookSnapshot {
    /// Get the best bid
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    /// Get the best ask
    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    /// Get the spread (ask - bid)
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Get the mid price ((ask + bid) / 2)
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some((ask.price + bid.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Top N bids
    pub fn top_bids(&self, n: usize) -> &[Level] {
        &self.bids[..n.min(self.bids.len())]
    }

    /// Top N asks
    pub fn top_asks(&self, n: usize) -> &[Level] {
        &self.asks[..n.min(self.asks.len())]
    }
}
