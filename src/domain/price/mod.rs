//! Price domain: the latest price per token.

pub mod state;
pub mod wire;

pub use state::PriceTable;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::shared::TokenSlug;
use wire::TokenPriceData;

/// Latest known price for one token.
///
/// Records are replaced wholesale on every frame for the token; fields are
/// never merged across frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRecord {
    /// Canonical slug (`cg_id`, falling back to the lower-cased ticker).
    pub slug: TokenSlug,
    /// Display name, e.g. `"Bitcoin"`.
    pub name: String,
    /// Ticker symbol as sent, e.g. `"BTC"`.
    pub symbol: String,
    /// Price in the instrument's quote currency.
    pub price: f64,
    pub price_in_usd: f64,
    pub volume: f64,
    pub exchange: String,
    pub exchange_rank: u32,
    /// When the trade/quote happened upstream.
    pub event_time: DateTime<Utc>,
    /// When the service (or, failing that, this client) received it.
    pub arrival_time: DateTime<Utc>,
    pub sequence: u64,
}

impl PriceRecord {
    /// Convert a wire frame, stamping `received_at` when the frame carries
    /// no arrival timestamp of its own.
    ///
    /// Fails only when the frame's timestamp is not a parseable ISO-8601 time.
    pub fn from_wire(data: TokenPriceData, received_at: DateTime<Utc>) -> Result<Self, String> {
        let timestamp = parse_timestamp(&data.timestamp)
            .ok_or_else(|| format!("unparseable timestamp: {}", data.timestamp))?;

        let event_time = data
            .event_timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(timestamp);
        let arrival_time = data
            .arrival_timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        let slug = match data.cg_id.as_deref().map(str::trim) {
            Some(cg_id) if !cg_id.is_empty() => TokenSlug::new(cg_id),
            _ => TokenSlug::new(&data.token_symbol),
        };

        Ok(Self {
            slug,
            name: data.token_name.unwrap_or_else(|| data.token_symbol.clone()),
            price_in_usd: data.price_in_usd.unwrap_or(data.price),
            price: data.price,
            volume: data.volume.unwrap_or_default(),
            exchange: data.exchange.unwrap_or_default(),
            exchange_rank: data.exchange_rank.unwrap_or_default(),
            sequence: data.sequence.unwrap_or_default(),
            symbol: data.token_symbol,
            event_time,
            arrival_time,
        })
    }
}

/// Parse RFC 3339 timestamps, plus zone-less ISO-8601 forms taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
