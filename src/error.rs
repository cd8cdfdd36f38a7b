//! Unified stream error types.

use thiserror::Error;

/// Errors surfaced to consumers, either returned from a call or delivered
/// through the `error` channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code} reason={reason}")]
    Closed { code: u16, reason: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No tokio runtime available")]
    NoRuntime,

    #[error("Stream task has stopped")]
    ChannelClosed,
}

impl StreamError {
    /// Whether the stream stops reconnecting after this error until the
    /// consumer calls `connect()` again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::AuthenticationFailed(_)
                | StreamError::ReconnectExhausted { .. }
                | StreamError::ChannelClosed
        )
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("API key is missing")]
    MissingApiKey,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

/// Transport failure classification fed into the connection manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("{0}")]
    Io(String),

    #[error("Timed out")]
    Timeout,

    /// Handshake refused because of the credentials (HTTP 401/403).
    #[error("Rejected: {0}")]
    AuthRejected(String),
}

impl TransportError {
    /// Classify a non-101 handshake response.
    pub fn from_handshake_status(status: u16) -> Self {
        match status {
            401 | 403 => TransportError::AuthRejected(format!("handshake returned {status}")),
            _ => TransportError::Io(format!("handshake returned {status}")),
        }
    }
}

#[cfg(feature = "ws-native")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsErr;

        match err {
            WsErr::Http(response) => TransportError::from_handshake_status(response.status().as_u16()),
            other => TransportError::Io(other.to_string()),
        }
    }
}
