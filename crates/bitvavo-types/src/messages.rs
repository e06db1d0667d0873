//! Stream control messages and inbound frame parsing

use crate::enums::Channel;
use crate::error::BitvavoError;
use crate::error_codes::ApiError;
use crate::level::Level;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Orderbook payload: a REST snapshot or a stream delta
///
/// Both carry the book `nonce`, which is the sequence number used for
/// gap detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookData {
    /// Market identifier (e.g., "BTC-EUR")
    #[serde(default)]
    pub market: String,
    /// Sequence number of this book state / delta
    pub nonce: u64,
    /// Bid levels
    #[serde(default)]
    pub bids: Vec<Level>,
    /// Ask levels
    #[serde(default)]
    pub asks: Vec<Level>,
}

/// Action of a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start receiving a channel
    Subscribe,
    /// Stop receiving a channel
    Unsubscribe,
}

/// One channel entry inside a control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name
    pub name: Channel,
    /// Markets for this channel
    pub markets: Vec<String>,
}

/// Subscribe / unsubscribe control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Subscribe or unsubscribe
    pub action: Action,
    /// Channels affected
    pub channels: Vec<ChannelSpec>,
}

impl ControlMessage {
    /// Build a control message grouping `(channel, market)` pairs by channel
    pub fn new(action: Action, pairs: impl IntoIterator<Item = (Channel, String)>) -> Self {
        let mut channels: Vec<ChannelSpec> = Vec::new();
        for (channel, market) in pairs {
            match channels.iter_mut().find(|spec| spec.name == channel) {
                Some(spec) => spec.markets.push(market),
                None => channels.push(ChannelSpec {
                    name: channel,
                    markets: vec![market],
                }),
            }
        }
        Self { action, channels }
    }

    /// Returns true if the message carries no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Authentication request sent at the start of a private session
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticateRequest {
    /// Always "authenticate"
    pub action: &'static str,
    /// API key
    pub key: String,
    /// Hex HMAC signature
    pub signature: String,
    /// Request timestamp (ms)
    pub timestamp: i64,
    /// Access window (ms)
    pub window: u64,
}

impl AuthenticateRequest {
    /// Create an authenticate request
    pub fn new(key: impl Into<String>, signature: String, timestamp: i64, window: u64) -> Self {
        Self {
            action: "authenticate",
            key: key.into(),
            signature,
            timestamp,
            window,
        }
    }
}

/// Parsed inbound stream frame
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    /// Answer to an authenticate request
    Authenticate {
        /// Whether the server accepted the credentials
        authenticated: bool,
    },
    /// Subscription acknowledgement
    Subscribed(Value),
    /// Unsubscription acknowledgement
    Unsubscribed(Value),
    /// Book delta
    Book(BookData),
    /// Any other market or account event, routed without interpretation
    Channel {
        /// Channel carrying the event
        channel: Channel,
        /// Market of the event
        market: String,
        /// Raw payload
        payload: Value,
    },
    /// Server error frame
    Error {
        /// Action that failed, if reported
        action: Option<String>,
        /// Parsed error
        error: ApiError,
    },
    /// Anything else
    Unknown(Value),
}

impl WsMessage {
    /// Parse a raw text frame
    pub fn parse(text: &str) -> Result<Self, BitvavoError> {
        let value: Value = serde_json::from_str(text).map_err(|e| BitvavoError::InvalidJson {
            message: e.to_string(),
            raw: Some(text.to_string()),
        })?;

        if let Some(error) = ApiError::from_body(&value) {
            let action = value
                .get("action")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Self::Error { action, error });
        }

        let event = match value.get("event").and_then(Value::as_str) {
            Some(event) => event.to_string(),
            None => return Ok(Self::Unknown(value)),
        };

        match event.as_str() {
            "authenticate" => Ok(Self::Authenticate {
                authenticated: value
                    .get("authenticated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "subscribed" => Ok(Self::Subscribed(value)),
            "unsubscribed" => Ok(Self::Unsubscribed(value)),
            "book" => serde_json::from_value(value)
                .map(Self::Book)
                .map_err(|e| BitvavoError::InvalidJson {
                    message: e.to_string(),
                    raw: Some(text.to_string()),
                }),
            other => match Channel::from_event(other) {
                Some(channel) => {
                    let market = value
                        .get("market")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok(Self::Channel {
                        channel,
                        market,
                        payload: value,
                    })
                }
                None => Ok(Self::Unknown(value)),
            },
        }
    }
}
