//! Example: Rate-limited REST requests across several API keys
//!
//! Set BITVAVO_API_KEY/BITVAVO_API_SECRET (and optionally
//! BITVAVO_API_KEY_1/BITVAVO_API_SECRET_1, ...) before running.
//!
//! Run with: cargo run --example rest_requests

use bitvavo_sdk::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Bitvavo REST Requests ===\n");

    let config = ClientConfig::from_env()?.with_prefer_keyless(true);
    let has_keys = !config.credentials.is_empty();
    let client = Arc::new(BitvavoClient::new(config)?);

    let offset = client.sync_clock().await;
    println!("Clock offset: {} ms (positive = local ahead)", offset);
    println!("Server time:  {}\n", client.server_time().await?);

    // Public requests fan out concurrently; the limiter picks a credential for each
    let markets = ["BTC-EUR", "ETH-EUR", "SOL-EUR", "ADA-EUR"];
    let mut handles = Vec::new();
    for market in markets {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let book = client.book_snapshot(market).await;
            (market, book)
        }));
    }
    for handle in handles {
        match handle.await? {
            (market, Ok(book)) => println!(
                "{:<8} nonce {:>10}  {} bids / {} asks",
                market,
                book.nonce,
                book.bids.len(),
                book.asks.len()
            ),
            (market, Err(e)) => println!("{:<8} failed: {}", market, e),
        }
    }

    if has_keys {
        let balance = client
            .request(&RequestDescriptor::get("/balance").authenticated())
            .await;
        match balance {
            Ok(response) => println!("\nBalance via {}: {}", response.credential, response.body),
            Err(e) if e.is_fatal() => println!("\nBalance rejected: {}", e),
            Err(e) => println!("\nBalance failed: {}", e),
        }
    }

    println!("\nBudgets:");
    for (id, budget) in client.budgets() {
        println!(
            "  {:<8} remaining {:>5}  reset at {:?}  banned until {:?}",
            id.to_string(),
            budget.remaining,
            budget.reset_at_ms,
            budget.banned_until_ms
        );
    }

    client.shutdown();
    Ok(())
}
