//! Endpoints the client itself depends on
//!
//! The full endpoint catalogue is left to callers through
//! [`RestTransport::send`]; only server time (for skew estimation) and book
//! snapshots (for order book resync) are wrapped here.

use bitvavo_types::BookData;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::RestResult;
use crate::transport::{RequestDescriptor, RestTransport};

/// Weight of `GET /time`
pub const WEIGHT_TIME: u32 = 1;
/// Weight of `GET /{market}/book`
pub const WEIGHT_BOOK: u32 = 1;
/// Weight of `GET /{market}/trades`
pub const WEIGHT_TRADES: u32 = 5;
/// Weight of `GET /ordersOpen`
pub const WEIGHT_ORDERS_OPEN: u32 = 25;

/// Weight the server charges for a path
pub fn weight_for_path(path: &str) -> u32 {
    let path = path.split('?').next().unwrap_or(path);
    if path == "/ordersOpen" {
        WEIGHT_ORDERS_OPEN
    } else if path.ends_with("/trades") {
        WEIGHT_TRADES
    } else {
        1
    }
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    time: i64,
}

impl RestTransport {
    /// Server time in epoch ms
    #[instrument(skip(self))]
    pub async fn server_time(&self) -> RestResult<i64> {
        let request = RequestDescriptor::get("/time").with_weight(WEIGHT_TIME);
        let time: ServerTime = self.send(&request).await?.json()?;
        Ok(time.time)
    }

    /// Full order book snapshot for a market
    ///
    /// `depth` limits the number of levels per side.
    #[instrument(skip(self))]
    pub async fn book_snapshot(&self, market: &str, depth: Option<u32>) -> RestResult<BookData> {
        let mut path = format!("/{}/book", market);
        if let Some(depth) = depth {
            path.push_str(&format!("?depth={}", depth));
        }

        let request = RequestDescriptor::get(path).with_weight(WEIGHT_BOOK);
        let mut book: BookData = self.send(&request).await?.json()?;
        if book.market.is_empty() {
            book.market = market.to_string();
        }
        debug!(
            market,
            nonce = book.nonce,
            bids = book.bids.len(),
            asks = book.asks.len(),
            "Fetched book snapshot"
        );
        Ok(book)
    }
}
