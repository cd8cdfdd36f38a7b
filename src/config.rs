//! Stream configuration and subscription plan limits.

use crate::error::ConfigError;
use crate::shared::TokenSlug;
use crate::ws::reconnect::ReconnectPolicy;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_API_KEY: &str = "TOKENMETRICS_API_KEY";
pub const ENV_WS_URL: &str = "TOKENMETRICS_WS_URL";
pub const ENV_PLAN: &str = "PRICE_STREAM_PLAN";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "PRICE_STREAM_MAX_RECONNECT_ATTEMPTS";
pub const ENV_BASE_RECONNECT_DELAY_MS: &str = "PRICE_STREAM_BASE_RECONNECT_DELAY_MS";
pub const ENV_MAX_RECONNECT_DELAY_MS: &str = "PRICE_STREAM_MAX_RECONNECT_DELAY_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "PRICE_STREAM_HEARTBEAT_INTERVAL_MS";

// ─── Auth mode ───────────────────────────────────────────────────────────────

/// How the API key reaches the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// `{"type":"auth","x-api-key":…}` as the first frame after open.
    #[default]
    Message,
    /// `x-api-key` header on the upgrade request.
    Header,
}

// ─── Plans ───────────────────────────────────────────────────────────────────

/// Subscription tier. Limits are advisory; the client only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Plan {
    #[default]
    Basic,
    Advanced,
    Premium,
    Vip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub connections: u32,
    pub symbols: usize,
    pub messages_per_sec: u32,
}

/// Outcome of [`Plan::validate_token_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenListCheck {
    pub is_valid: bool,
    pub max_allowed: usize,
    pub excess: usize,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Basic, Plan::Advanced, Plan::Premium, Plan::Vip];

    pub fn limits(&self) -> PlanLimits {
        let (connections, symbols, messages_per_sec) = match self {
            Plan::Basic => (1, 15, 1),
            Plan::Advanced => (3, 60, 3),
            Plan::Premium => (6, 120, 8),
            Plan::Vip => (12, 250, 12),
        };
        PlanLimits {
            connections,
            symbols,
            messages_per_sec,
        }
    }

    /// Smallest plan whose symbol limit covers `token_count`, else `Vip`.
    pub fn recommended_for(token_count: usize) -> Plan {
        Plan::ALL
            .into_iter()
            .find(|p| token_count <= p.limits().symbols)
            .unwrap_or(Plan::Vip)
    }

    pub fn validate_token_list(&self, tokens: &[TokenSlug]) -> TokenListCheck {
        let max_allowed = self.limits().symbols;
        TokenListCheck {
            is_valid: tokens.len() <= max_allowed,
            max_allowed,
            excess: tokens.len().saturating_sub(max_allowed),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plan::Basic => "basic",
            Plan::Advanced => "advanced",
            Plan::Premium => "premium",
            Plan::Vip => "vip",
        };
        f.write_str(name)
    }
}

impl FromStr for Plan {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(Plan::Basic),
            "advanced" => Ok(Plan::Advanced),
            "premium" => Ok(Plan::Premium),
            "vip" => Ok(Plan::Vip),
            _ => Err(ConfigError::InvalidEnv {
                var: ENV_PLAN.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

// ─── StreamConfig ────────────────────────────────────────────────────────────

/// Configuration for a [`PriceStream`](crate::ws::native::PriceStream).
///
/// Build with struct-update syntax over [`StreamConfig::new`]:
///
/// ```rust,ignore
/// let config = StreamConfig {
///     heartbeat_interval_ms: 0,
///     ..StreamConfig::new("my-api-key")
/// };
/// ```
#[derive(Clone, PartialEq)]
pub struct StreamConfig {
    pub url: String,
    pub api_key: String,
    pub auth_mode: AuthMode,
    /// Automatic reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// ±25% jitter on reconnect delays, still capped at the max.
    pub reconnect_jitter: bool,
    /// WebSocket ping interval; 0 disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Close codes treated as a credential rejection (no reconnect).
    pub auth_rejection_codes: Vec<u16>,
    pub plan: Plan,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: crate::network::DEFAULT_WS_URL.to_string(),
            api_key: String::new(),
            auth_mode: AuthMode::Message,
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            reconnect_jitter: false,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 30_000,
            auth_rejection_codes: vec![1002, 1003],
            plan: Plan::Basic,
        }
    }
}

// Keeps the key out of logs.
impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("auth_mode", &self.auth_mode)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("base_reconnect_delay_ms", &self.base_reconnect_delay_ms)
            .field("max_reconnect_delay_ms", &self.max_reconnect_delay_ms)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("auth_rejection_codes", &self.auth_rejection_codes)
            .field("plan", &self.plan)
            .finish()
    }
}

impl StreamConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Read the configuration from the process environment.
    ///
    /// `TOKENMETRICS_API_KEY` is required; everything else falls back to the
    /// defaults. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let mut config = Self::new(get(ENV_API_KEY).ok_or(ConfigError::MissingApiKey)?);
        if let Some(url) = get(ENV_WS_URL) {
            config.url = url.trim().to_string();
        }
        if let Some(plan) = get(ENV_PLAN) {
            config.plan = plan.parse()?;
        }
        if let Some(v) = get(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.max_reconnect_attempts = parse_env(ENV_MAX_RECONNECT_ATTEMPTS, &v)?;
        }
        if let Some(v) = get(ENV_BASE_RECONNECT_DELAY_MS) {
            config.base_reconnect_delay_ms = parse_env(ENV_BASE_RECONNECT_DELAY_MS, &v)?;
        }
        if let Some(v) = get(ENV_MAX_RECONNECT_DELAY_MS) {
            config.max_reconnect_delay_ms = parse_env(ENV_MAX_RECONNECT_DELAY_MS, &v)?;
        }
        if let Some(v) = get(ENV_HEARTBEAT_INTERVAL_MS) {
            config.heartbeat_interval_ms = parse_env(ENV_HEARTBEAT_INTERVAL_MS, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.base_reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidBackoff(
                "base reconnect delay must be positive".to_string(),
            ));
        }
        if self.base_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(ConfigError::InvalidBackoff(format!(
                "base delay {}ms exceeds max delay {}ms",
                self.base_reconnect_delay_ms, self.max_reconnect_delay_ms
            )));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.base_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            jitter: self.reconnect_jitter,
        }
    }

    /// `None` when the heartbeat is disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
