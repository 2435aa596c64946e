use crate::error::Result;
use crate::types::Quote;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Source of current and historical prices. Any failure means "temporarily
/// unavailable" to callers.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;

    /// Close of the last one-minute bar at or before `at_or_before_ms`.
    async fn historical_close(&self, symbol: &str, at_or_before_ms: i64) -> Result<Decimal>;

    /// USD value of one unit of `currency`.
    async fn usd_rate(&self, currency: &str) -> Result<Decimal>;
}
