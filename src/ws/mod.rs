//! WebSocket layer: messages, subscriptions, events, connection management.
//!
//! The connection logic lives in a transport-agnostic state machine
//! (`connection.rs`); the `ws-native` feature adds the `tokio-tungstenite`
//! driver that executes its actions (`native.rs`). This module defines the
//! shared message and event types.

pub mod connection;
pub mod dispatcher;
pub mod reconnect;
pub mod subscriptions;

#[cfg(feature = "ws-native")]
pub mod native;

use crate::domain::price::wire::{is_price_shaped, TokenPriceData};
use crate::domain::price::PriceRecord;
use crate::error::StreamError;
use crate::shared::TokenSlug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

pub use connection::{Action, ConnectionManager, Step};
pub use reconnect::ReconnectPolicy;
pub use subscriptions::SubscriptionTracker;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// ─── Connection state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Messages sent from client to server.
///
/// The service uses two unrelated shapes, so the enum is untagged:
/// `{"type":"auth","x-api-key":…}` and `{"is_append":0|1,"tokens":[…]}`.
#[derive(Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageOut {
    Auth {
        #[serde(rename = "type")]
        type_: &'static str,
        #[serde(rename = "x-api-key")]
        api_key: String,
    },
    Subscribe {
        #[serde(serialize_with = "bool_as_int")]
        is_append: bool,
        tokens: Vec<TokenSlug>,
    },
}

fn bool_as_int<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

impl MessageOut {
    pub fn auth(api_key: impl Into<String>) -> Self {
        MessageOut::Auth {
            type_: "auth",
            api_key: api_key.into(),
        }
    }

    /// Replace the whole subscription set with `tokens`.
    pub fn replace(tokens: Vec<TokenSlug>) -> Self {
        MessageOut::Subscribe {
            is_append: false,
            tokens,
        }
    }

    /// Add `tokens` to the subscription set.
    pub fn append(tokens: Vec<TokenSlug>) -> Self {
        MessageOut::Subscribe {
            is_append: true,
            tokens,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Never print the key.
impl fmt::Display for MessageOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageOut::Auth { .. } => write!(f, "auth(<redacted>)"),
            MessageOut::Subscribe { is_append, tokens } => {
                let mode = if *is_append { "append" } else { "replace" };
                write!(f, "{mode}(")?;
                for (i, token) in tokens.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{token}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Debug for MessageOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageOut::{self}")
    }
}

// ─── Inbound messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Price(PriceRecord),
    AuthResponse {
        success: bool,
        message: Option<String>,
    },
    /// Malformed or unrecognised; the payload says why.
    Unknown(String),
}

impl Inbound {
    pub fn parse(text: &str, received_at: DateTime<Utc>) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Inbound::Unknown(format!("invalid JSON: {e}")),
        };

        if value.get("type").and_then(|t| t.as_str()) == Some("auth_response") {
            return match serde_json::from_value::<AuthResponse>(value) {
                Ok(resp) => Inbound::AuthResponse {
                    success: resp.success,
                    message: resp.message,
                },
                Err(e) => Inbound::Unknown(format!("bad auth_response: {e}")),
            };
        }

        if !is_price_shaped(&value) {
            return Inbound::Unknown("not a price frame".to_string());
        }

        match serde_json::from_value::<TokenPriceData>(value) {
            Ok(data) => match PriceRecord::from_wire(data, received_at) {
                Ok(record) => Inbound::Price(record),
                Err(e) => Inbound::Unknown(e),
            },
            Err(e) => Inbound::Unknown(format!("bad price frame: {e}")),
        }
    }
}

// ─── StreamEvent ─────────────────────────────────────────────────────────────

/// Events delivered to consumers through the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    PriceUpdate(PriceRecord),
    ConnectionChange(ConnectionState),
    Error(StreamError),
    SubscriptionUpdate(Vec<TokenSlug>),
}
