//! BTreeMap-based price level storage
//!
//! Bids are keyed by `Reverse<Decimal>` so iteration runs highest price
//! first; asks use the natural ascending order. Values are sizes.

use bitvavo_types::Level;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Ordered price → size mapping for both sides of a book
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl TreeBook {
    /// Create a new empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a bid level; a zero size removes it
    pub fn set_bid(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.bids.remove(&Reverse(price));
        } else {
            self.bids.insert(Reverse(price), size);
        }
    }

    /// Set an ask level; a zero size removes it
    pub fn set_ask(&mut self, price: Decimal, size: Decimal) {
        if size.is_zero() {
            self.asks.remove(&price);
        } else {
            self.asks.insert(price, size);
        }
    }

    /// Apply a batch of bid and ask levels
    pub fn apply(&mut self, bids: &[Level], asks: &[Level]) {
        for level in bids {
            self.set_bid(level.price, level.size);
        }
        for level in asks {
            self.set_ask(level.price, level.size);
        }
    }

    /// Replace the whole book
    pub fn load(&mut self, bids: &[Level], asks: &[Level]) {
        self.clear();
        self.apply(bids, asks);
    }

    /// Size resting at a bid price
    pub fn bid_size(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&Reverse(price)).copied()
    }

    /// Size resting at an ask price
    pub fn ask_size(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    /// Best bid (highest price)
    pub fn best_bid(&self) -> Option<Level> {
        self.bids
            .iter()
            .next()
            .map(|(Reverse(price), size)| Level::new(*price, *size))
    }

    /// Best ask (lowest price)
    pub fn best_ask(&self) -> Option<Level> {
        self.asks
            .iter()
            .next()
            .map(|(price, size)| Level::new(*price, *size))
    }

    /// Top N bids, best first
    pub fn top_bids(&self, n: usize) -> Vec<Level> {
        self.bids
            .iter()
            .take(n)
            .map(|(Reverse(price), size)| Level::new(*price, *size))
            .collect()
    }

    /// Top N asks, best first
    pub fn top_asks(&self, n: usize) -> Vec<Level> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, size)| Level::new(*price, *size))
            .collect()
    }

    /// All bids, best first
    pub fn bids_vec(&self) -> Vec<Level> {
        self.top_bids(usize::MAX)
    }

    /// All asks, best first
    pub fn asks_vec(&self) -> Vec<Level> {
        self.top_asks(usize::MAX)
    }

    /// Number of bid levels
    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask levels
    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }

    /// Check if the book is empty
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Clear all levels
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }
}
