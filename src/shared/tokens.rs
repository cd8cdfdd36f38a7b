//! Token catalogue and slug normalization.

use super::TokenSlug;

/// Display metadata for a well-known token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub slug: &'static str,
    pub symbol: &'static str,
    pub name: &'static str,
}

impl TokenInfo {
    const fn new(slug: &'static str, symbol: &'static str, name: &'static str) -> Self {
        Self { slug, symbol, name }
    }

    /// `"Bitcoin (BTC)"`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.symbol)
    }

    pub fn token_slug(&self) -> TokenSlug {
        TokenSlug::new(self.slug)
    }
}

/// Tokens the price service supports out of the box, in display order.
pub const POPULAR_TOKENS: &[TokenInfo] = &[
    TokenInfo::new("bitcoin", "BTC", "Bitcoin"),
    TokenInfo::new("ethereum", "ETH", "Ethereum"),
    TokenInfo::new("solana", "SOL", "Solana"),
    TokenInfo::new("cardano", "ADA", "Cardano"),
    TokenInfo::new("polygon", "MATIC", "Polygon"),
    TokenInfo::new("chainlink", "LINK", "Chainlink"),
    TokenInfo::new("avalanche", "AVAX", "Avalanche"),
    TokenInfo::new("polkadot", "DOT", "Polkadot"),
    TokenInfo::new("litecoin", "LTC", "Litecoin"),
    TokenInfo::new("uniswap", "UNI", "Uniswap"),
    TokenInfo::new("aave", "AAVE", "Aave"),
    TokenInfo::new("cosmos", "ATOM", "Cosmos"),
    TokenInfo::new("algorand", "ALGO", "Algorand"),
    TokenInfo::new("near", "NEAR", "NEAR Protocol"),
    TokenInfo::new("fantom", "FTM", "Fantom"),
    TokenInfo::new("harmony", "ONE", "Harmony"),
    TokenInfo::new("theta", "THETA", "Theta Network"),
    TokenInfo::new("elrond", "EGLD", "MultiversX"),
];

/// Whether `slug` is one of the catalogued slugs (case-insensitive).
pub fn is_known_slug(slug: &str) -> bool {
    let slug = slug.trim().to_lowercase();
    POPULAR_TOKENS.iter().any(|t| t.slug == slug)
}

/// Normalize user input to a slug.
///
/// Known slugs pass through, known ticker symbols map to their slug
/// (`"BTC"` → `"bitcoin"`), anything else is lower-cased and trimmed so less
/// common tokens still work.
pub fn normalize_token_slug(input: &str) -> TokenSlug {
    let normalized = input.trim().to_lowercase();

    if is_known_slug(&normalized) {
        return TokenSlug::new(normalized);
    }

    match POPULAR_TOKENS
        .iter()
        .find(|t| t.symbol.to_lowercase() == normalized)
    {
        Some(token) => token.token_slug(),
        None => TokenSlug::new(normalized),
    }
}

/// Look up catalogue metadata by slug first, then by ticker symbol.
pub fn token_info(slug_or_symbol: &str) -> Option<&'static TokenInfo> {
    let normalized = slug_or_symbol.trim().to_lowercase();

    POPULAR_TOKENS
        .iter()
        .find(|t| t.slug == normalized)
        .or_else(|| {
            POPULAR_TOKENS
                .iter()
                .find(|t| t.symbol.to_lowercase() == normalized)
        })
}

/// Catalogue entries whose slug, symbol or name contains `input`.
///
/// Blank input returns the first `limit` catalogue entries.
pub fn suggest_tokens(input: &str, limit: usize) -> Vec<&'static TokenInfo> {
    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return POPULAR_TOKENS.iter().take(limit).collect();
    }

    POPULAR_TOKENS
        .iter()
        .filter(|t| {
            t.slug.contains(&normalized)
                || t.symbol.to_lowercase().contains(&normalized)
                || t.name.to_lowercase().contains(&normalized)
        })
        .take(limit)
        .collect()
}

/// Parse a comma and/or whitespace separated token list.
///
/// Each entry is normalized with [`normalize_token_slug`]; empties and
/// duplicates are dropped, first occurrence wins.
pub fn parse_token_list(input: &str) -> Vec<TokenSlug> {
    let mut out: Vec<TokenSlug> = Vec::new();
    for raw in input.split(|c: char| c == ',' || c.is_whitespace()) {
        let slug = normalize_token_slug(raw);
        if !slug.is_empty() && !out.contains(&slug) {
            out.push(slug);
        }
    }
    out
}
