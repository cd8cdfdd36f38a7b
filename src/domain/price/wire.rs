//! Wire types for inbound price frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A price frame as the service sends it.
///
/// Only `token_symbol`, `price` and `timestamp` are guaranteed; the service
/// sends many more fields (order side, maker address, rolling message
/// buffers) that the price table does not use and are skipped here.
/// A badly typed optional field reads as `None` instead of rejecting the
/// frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPriceData {
    pub token_symbol: String,
    pub price: f64,
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient")]
    pub cg_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub token_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub exchange: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub exchange_rank: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub price_in_usd: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub sequence: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub event_timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub arrival_timestamp: Option<String>,
}

/// Numbers sent as strings (`"17"`) are accepted; anything else that does
/// not fit `T` is `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if let Ok(parsed) = T::deserialize(&value) {
        return Ok(Some(parsed));
    }
    Ok(match &value {
        Value::String(s) => serde_json::from_str(s.trim()).ok(),
        _ => None,
    })
}

/// Whether a parsed JSON value has the minimum shape of a price frame:
/// string `token_symbol`, numeric `price`, string `timestamp`.
pub fn is_price_shaped(value: &Value) -> bool {
    value.get("token_symbol").is_some_and(|v| v.is_string())
        && value.get("price").is_some_and(|v| v.is_number())
        && value.get("timestamp").is_some_and(|v| v.is_string())
}
