//! Channel and Side enums

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket channel types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Best bid/ask and last price
    Ticker,
    /// Rolling 24h statistics
    #[serde(rename = "ticker24h")]
    Ticker24h,
    /// Level 2 orderbook deltas
    Book,
    /// Public trades
    Trades,
    /// OHLC candles
    Candles,
    /// Private order and fill events
    Account,
}

impl Channel {
    /// Returns the channel name as used in control messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Ticker24h => "ticker24h",
            Self::Book => "book",
            Self::Trades => "trades",
            Self::Candles => "candles",
            Self::Account => "account",
        }
    }

    /// Map the `event` field of a server frame to the channel that carries it
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "ticker" => Some(Self::Ticker),
            "ticker24h" => Some(Self::Ticker24h),
            "book" => Some(Self::Book),
            "trade" => Some(Self::Trades),
            "candle" => Some(Self::Candles),
            "order" | "fill" => Some(Self::Account),
            _ => None,
        }
    }

    /// Returns true if this is a private (authenticated) channel
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Account)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}
