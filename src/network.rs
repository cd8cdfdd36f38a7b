//! Network URL constants for the price stream.

/// Default price-streaming WebSocket URL.
pub const DEFAULT_WS_URL: &str = "wss://price.data-service.tokenmetrics.com";
