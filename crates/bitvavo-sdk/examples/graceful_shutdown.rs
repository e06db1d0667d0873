//! Example: Graceful Shutdown with Signal Handling
//!
//! Streams trades until Ctrl+C, then stops the stream, the order book
//! synchronizers and the rate limiter and waits for them to finish.
//!
//! Run with: cargo run --example graceful_shutdown

use bitvavo_sdk::prelude::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Graceful Shutdown Example ===\n");
    println!("Press Ctrl+C to trigger graceful shutdown\n");

    let client = BitvavoClient::connect(ClientConfig::from_env()?).await?;
    let refresh = client.spawn_skew_refresh(Duration::from_secs(300));

    let mut stream_events = client.stream_events().expect("stream events already taken");
    let mut trades = client.subscribe(Channel::Trades, "BTC-EUR");
    client.track_book("BTC-EUR");

    let mut trade_count = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n[SIGNAL] Received Ctrl+C, shutting down...");
                break;
            }
            Some(event) = stream_events.recv() => match event {
                StreamEvent::StateChanged { from, to } => println!("[CONNECTION] {:?} -> {:?}", from, to),
                StreamEvent::Reconnecting { attempt, delay } => {
                    println!("[CONNECTION] reconnect attempt {} in {:?}", attempt, delay)
                }
                StreamEvent::Fatal { error } => {
                    println!("[CONNECTION] fatal: {}", error);
                    break;
                }
                _ => {}
            },
            Some(_frame) = trades.recv() => {
                trade_count += 1;
                if trade_count % 25 == 0 {
                    println!("[TRADES] {} received", trade_count);
                }
            }
        }
    }

    if let Ok(book) = client.book("BTC-EUR") {
        println!("Last book nonce: {}", book.sequence);
    }

    client.shutdown();
    client.wait_closed().await;
    refresh.await?;

    println!("Processed {} trades", trade_count);
    println!("Shutdown complete.");
    Ok(())
}
