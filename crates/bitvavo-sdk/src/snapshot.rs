//! Order book snapshots fetched over REST

use std::sync::Arc;

use async_trait::async_trait;
use bitvavo_rest::RestTransport;
use bitvavo_types::BookData;
use bitvavo_ws::{SnapshotSource, WsError, WsResult};

/// Feeds order book synchronizers from `GET /{market}/book`
///
/// Snapshot requests go through the same rate limiter as every other REST
/// call.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    rest: Arc<RestTransport>,
    depth: Option<u32>,
}

impl RestSnapshotSource {
    /// Create a source; `depth` limits levels per side
    pub fn new(rest: Arc<RestTransport>, depth: Option<u32>) -> Self {
        Self { rest, depth }
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch_snapshot(&self, market: &str) -> WsResult<BookData> {
        self.rest
            .book_snapshot(market, self.depth)
            .await
            .map_err(|e| WsError::Snapshot {
                market: market.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvavo_rest::{MockBackend, MockClock, RateLimitConfig, RetryPolicy, TransportConfig};
    use serde_json::json;

    fn source(backend: Arc<MockBackend>, depth: Option<u32>) -> RestSnapshotSource {
        let rest = RestTransport::new(
            TransportConfig::default().with_retry(RetryPolicy::none()),
            vec![],
            RateLimitConfig::default(),
            backend,
            Arc::new(MockClock::new(1_700_000_000_000)),
        );
        RestSnapshotSource::new(Arc::new(rest), depth)
    }

    #[tokio::test]
    async fn test_fetch_snapshot() {
        let backend = Arc::new(MockBackend::new());
        backend.push_json(json!({
            "market": "BTC-EUR",
            "nonce": 4321,
            "bids": [["30000", "0.5"]],
            "asks": [["30010", "1.25"]]
        }));

        let book = source(Arc::clone(&backend), Some(25))
            .fetch_snapshot("BTC-EUR")
            .await
            .unwrap();
        assert_eq!(book.nonce, 4321);
        assert_eq!(book.bids.len(), 1);
        assert!(backend.requests()[0].url.ends_with("/BTC-EUR/book?depth=25"));
    }

    #[tokio::test]
    async fn test_rest_failure_becomes_snapshot_error() {
        let backend = Arc::new(MockBackend::new());
        backend.push_response(404, &[], r#"{"errorCode":205,"error":"market parameter is invalid."}"#);

        let err = source(backend, None).fetch_snapshot("NOPE-EUR").await.unwrap_err();
        match err {
            WsError::Snapshot { market, message } => {
                assert_eq!(market, "NOPE-EUR");
                assert!(message.contains("205"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
