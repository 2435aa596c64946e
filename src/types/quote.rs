use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest known price for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Decimal,
    /// Provider timestamp in milliseconds
    pub timestamp: i64,
}

impl Quote {
    pub fn new(price: Decimal, timestamp: i64) -> Self {
        Self { price, timestamp }
    }
}

/// Uppercased, trimmed symbol used as the cache and subscription key.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
