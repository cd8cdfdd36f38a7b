//! Price table, the latest record per token slug.

use super::PriceRecord;
use crate::shared::TokenSlug;
use std::collections::HashMap;

/// Latest price per token, keyed by slug.
///
/// Written only by the connection manager's message path; everything else
/// reads. Records are overwritten in arrival order with no sequence checks.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    records: HashMap<TokenSlug, PriceRecord>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record`, replacing whatever was there for its slug.
    pub fn upsert(&mut self, record: PriceRecord) {
        self.records.insert(record.slug.clone(), record);
    }

    /// Look up by slug, then by ticker symbol (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&PriceRecord> {
        let slug = TokenSlug::new(key);
        if slug.is_empty() {
            return None;
        }
        self.records.get(&slug).or_else(|| {
            self.records
                .values()
                .find(|r| r.symbol.eq_ignore_ascii_case(slug.as_str()))
        })
    }

    /// Batch lookup. The result is keyed by the key as requested; misses
    /// are left out.
    pub fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, PriceRecord> {
        keys.iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.get(key).map(|r| (key.to_string(), r.clone()))
            })
            .collect()
    }

    /// All records, sorted by slug.
    pub fn records(&self) -> Vec<PriceRecord> {
        let mut records: Vec<PriceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.slug.cmp(&b.slug));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(slug: &str, symbol: &str, price: f64, sequence: u64) -> PriceRecord {
        PriceRecord {
            slug: TokenSlug::new(slug),
            name: slug.to_string(),
            symbol: symbol.to_string(),
            price,
            price_in_usd: price,
            volume: 0.0,
            exchange: String::new(),
            exchange_rank: 0,
            event_time: Utc::now(),
            arrival_time: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_last_write_wins_in_arrival_order() {
        let mut table = PriceTable::new();
        table.upsert(record("bitcoin", "BTC", 100.0, 5));
        // Lower sequence, later arrival: still wins.
        table.upsert(record("bitcoin", "BTC", 101.0, 2));

        assert_eq!(table.len(), 1);
        let btc = table.get("bitcoin").unwrap();
        assert_eq!(btc.price, 101.0);
        assert_eq!(btc.sequence, 2);
    }

    #[test]
    fn test_get_by_slug_then_symbol() {
        let mut table = PriceTable::new();
        table.upsert(record("ethereum", "ETH", 3000.0, 1));

        assert!(table.get("ethereum").is_some());
        assert!(table.get("Ethereum").is_some());
        assert!(table.get("eth").is_some());
        assert!(table.get("ETH").is_some());
        assert!(table.get("solana").is_none());
        assert!(table.get("").is_none());
    }

    #[test]
    fn test_get_many_keyed_by_request() {
        let mut table = PriceTable::new();
        table.upsert(record("bitcoin", "BTC", 1.0, 1));
        table.upsert(record("solana", "SOL", 2.0, 1));

        let found = table.get_many(&["BTC", "solana", "dogecoin"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["BTC"].slug.as_str(), "bitcoin");
        assert_eq!(found["solana"].price, 2.0);
    }

    #[test]
    fn test_records_sorted_and_clear() {
        let mut table = PriceTable::new();
        table.upsert(record("solana", "SOL", 2.0, 1));
        table.upsert(record("bitcoin", "BTC", 1.0, 1));

        let slugs: Vec<_> = table.records().into_iter().map(|r| r.slug).collect();
        assert_eq!(slugs, vec![TokenSlug::new("bitcoin"), TokenSlug::new("solana")]);

        table.clear();
        assert!(table.is_empty());
    }
}
