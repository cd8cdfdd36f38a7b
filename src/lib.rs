//! # Price Stream
//!
//! A real-time token price streaming client: one WebSocket connection that
//! authenticates, keeps a dynamic set of token subscriptions, folds inbound
//! price frames into a keyed table and reconnects with exponential backoff
//! without losing subscriptions.
//!
//! ## Architecture
//!
//! The crate is organized in layers:
//!
//! 1. **Core**: Shared newtypes, token utilities, price records and the price table (always available)
//! 2. **Config / Errors**: `StreamConfig`, plan limits, `StreamError`
//! 3. **WebSocket core**: Wire messages, subscription tracking, backoff, event dispatch and the
//!    transport-agnostic connection state machine
//! 4. **Native transport**: `tokio-tungstenite` driver behind the `ws-native` feature, exposed as `PriceStream`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use price_stream::prelude::*;
//!
//! let stream = Arc::new(PriceStream::new(StreamConfig::new("my-api-key"))?);
//!
//! stream.on_price_update(|record| println!("{} = {}", record.symbol, record.price));
//! stream.on_connection_change({
//!     let stream = Arc::clone(&stream);
//!     move |state| {
//!         if *state == ConnectionState::Connected {
//!             let _ = stream.subscribe_to_tokens(["bitcoin", "ethereum"]);
//!         }
//!     }
//! });
//!
//! stream.connect();
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared newtypes and token utilities.
pub mod shared;

/// Domain modules: price records and the price table.
pub mod domain;

/// Network URL constants.
pub mod network;

// ── Layer 2: Config / Errors ─────────────────────────────────────────────────

/// Stream configuration and plan limits.
pub mod config;

/// Unified error types.
pub mod error;

// ── Layer 3 + 4: WebSocket ───────────────────────────────────────────────────

/// WebSocket client: messages, subscriptions, events, connection management.
pub mod ws;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Shared newtypes + token utilities
    pub use crate::shared::tokens::{normalize_token_slug, parse_token_list, token_info, TokenInfo};
    pub use crate::shared::TokenSlug;

    // Domain types
    pub use crate::domain::price::{PriceRecord, PriceTable};

    // Config
    pub use crate::config::{AuthMode, Plan, PlanLimits, StreamConfig, TokenListCheck};

    // Errors
    pub use crate::error::{ConfigError, StreamError};

    // Network
    pub use crate::network::DEFAULT_WS_URL;

    // WebSocket types
    pub use crate::ws::dispatcher::{Channel, EventDispatcher, HandlerId, HandlerScope};
    pub use crate::ws::{ConnectionState, MessageOut, StreamEvent};

    // Native client
    #[cfg(feature = "ws-native")]
    pub use crate::ws::native::PriceStream;
}
