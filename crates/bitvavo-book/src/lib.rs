//! Sequence-checked orderbook engine for Bitvavo market data
//!
//! This crate holds the price-level storage and the per-market state
//! machine that decides whether an incoming delta may be applied. It has
//! no async runtime and no networking; fetching snapshots is the caller's
//! job.
//!
//! # State Machine
//!
//! ```text
//! Unsynced --snapshot--> Synced --gap--> Unsynced --snapshot--> ...
//! ```
//!
//! # Example
//!
//! ```
//! use bitvavo_book::{DeltaOutcome, Orderbook, OrderbookState};
//! use bitvavo_types::BookData;
//!
//! let mut book = Orderbook::new("BTC-EUR");
//! assert_eq!(book.state(), OrderbookState::Unsynced);
//!
//! book.apply_snapshot(&BookData { market: "BTC-EUR".into(), nonce: 100, bids: vec![], asks: vec![] });
//! let delta = BookData { market: "BTC-EUR".into(), nonce: 101, bids: vec![], asks: vec![] };
//! assert_eq!(book.apply_delta(&delta), DeltaOutcome::Applied);
//! assert_eq!(book.sequence(), Some(101));
//! ```

pub mod orderbook;
pub mod storage;

// Re-export main types
pub use orderbook::{BookError, BookResult, DeltaOutcome, Orderbook, OrderbookSnapshot, OrderbookState};
pub use storage::TreeBook;
