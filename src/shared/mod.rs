//! Shared newtypes and utilities used across the crate.
//!
//! These types are serialization-transparent: they serialize/deserialize identically
//! to the raw strings the price service sends, so they can be used directly in wire
//! types without conversion overhead.

pub mod tokens;

pub use tokens::{normalize_token_slug, parse_token_list, suggest_tokens, token_info, TokenInfo};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

// ─── TokenSlug ───────────────────────────────────────────────────────────────

/// Canonical token identifier (e.g. `"bitcoin"`).
///
/// Always lower-cased and trimmed, so two slugs compare equal exactly when the
/// service would treat them as the same subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenSlug(String);

impl TokenSlug {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TokenSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TokenSlug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TokenSlug {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TokenSlug {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&String> for TokenSlug {
    fn from(s: &String) -> Self {
        Self::new(s)
    }
}

impl FromStr for TokenSlug {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl Serialize for TokenSlug {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenSlug {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_slug_is_canonical() {
        assert_eq!(TokenSlug::new("  Bitcoin "), TokenSlug::new("bitcoin"));
        assert_eq!(TokenSlug::new("ETHEREUM").as_str(), "ethereum");
    }

    #[test]
    fn test_token_slug_serde_transparent() {
        let json = serde_json::to_string(&TokenSlug::new("solana")).unwrap();
        assert_eq!(json, "\"solana\"");

        let parsed: TokenSlug = serde_json::from_str("\"Solana\"").unwrap();
        assert_eq!(parsed.as_str(), "solana");
    }
}
