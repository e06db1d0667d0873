//! Example: Keep a local BTC-EUR order book in sync
//!
//! Run with: cargo run --example orderbook_stream

use bitvavo_sdk::prelude::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== Bitvavo Orderbook Stream ===\n");

    let client = BitvavoClient::connect(ClientConfig::from_env()?.with_book_depth(25)).await?;

    let sync = client.track_book("BTC-EUR");
    let mut book_events = client.book_events("BTC-EUR").expect("book events already taken");

    let book = client.wait_book("BTC-EUR", Duration::from_secs(10)).await?;
    println!("=== SNAPSHOT for BTC-EUR (nonce {}) ===", book.sequence);
    print_snapshot(&book);
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut printed = 0;
    let max_prints = 30;

    loop {
        tokio::select! {
            Some(event) = book_events.recv() => match event {
                BookEvent::GapDetected { market, expected, received } => {
                    println!("WARNING: {} gap, expected nonce {} got {}", market, expected, received);
                }
                BookEvent::Degraded { market, gaps } => {
                    println!("WARNING: {} degraded after {} gaps", market, gaps);
                }
                BookEvent::Synced { market, sequence } => {
                    println!("{} resynced at nonce {}", market, sequence);
                }
                other => println!("{:?}", other),
            },
            _ = ticker.tick() => {
                match sync.book() {
                    Ok(book) => {
                        printed += 1;
                        println!(
                            "[{}/{}] nonce {} | Mid: {:.2} | Spread: {:.2}",
                            printed,
                            max_prints,
                            book.sequence,
                            book.mid_price().unwrap_or_default(),
                            book.spread().unwrap_or_default()
                        );
                    }
                    Err(e) => println!("Not available: {}", e),
                }
                if printed >= max_prints {
                    break;
                }
            }
        }
    }

    client.shutdown();
    client.wait_closed().await;
    println!("\nDone.");
    Ok(())
}

fn print_snapshot(book: &OrderbookSnapshot) {
    println!("  {:>14} {:>14}", "PRICE", "SIZE");
    for ask in book.top_asks(5).iter().rev() {
        println!("  {:>14} {:>14}  ask", ask.price, ask.size);
    }
    println!("  ------------------------------");
    for bid in book.top_bids(5) {
        println!("  {:>14} {:>14}  bid", bid.price, bid.size);
    }
}
