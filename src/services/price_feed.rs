use crate::error::{LedgerError, Result};
use crate::services::quote_cache::QuoteCache;
use crate::services::quote_provider::QuoteProvider;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Currencies treated as worth exactly one dollar.
const USD_PEGGED: &[&str] = &["USD", "USDT", "USDC", "DAI"];

/// Cache-first price lookup with a bounded HTTP fallback.
///
/// A timeout or provider error surfaces as `UpstreamUnavailable`; monitors
/// skip the item for this cycle, request handlers report it.
#[derive(Clone)]
pub struct PriceFeed {
    cache: Arc<QuoteCache>,
    provider: Arc<dyn QuoteProvider>,
    timeout: Duration,
}

impl PriceFeed {
    pub fn new(cache: Arc<QuoteCache>, provider: Arc<dyn QuoteProvider>, timeout: Duration) -> Self {
        Self {
            cache,
            provider,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<QuoteCache> {
        &self.cache
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::UpstreamUnavailable(format!(
                "{what} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Current price: streamed cache entry, else a direct quote.
    pub async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.cache.subscribe(symbol);
        if let Some(price) = self.cache.get(symbol) {
            return Ok(price);
        }
        debug!("Cache miss for {}, fetching quote", symbol);
        let quote = self
            .bounded(&format!("quote {symbol}"), self.provider.quote(symbol))
            .await?;
        Ok(quote.price)
    }

    /// Price used to settle an expired option: streamed cache entry, else the
    /// historical close at expiry.
    pub async fn expiry_price(&self, symbol: &str, expiry_ms: i64) -> Result<Decimal> {
        self.cache.subscribe(symbol);
        if let Some(price) = self.cache.get(symbol) {
            return Ok(price);
        }
        self.bounded(
            &format!("historical close {symbol}"),
            self.provider.historical_close(symbol, expiry_ms),
        )
        .await
    }

    /// USD value of one unit of `currency`.
    pub async fn usd_rate(&self, currency: &str) -> Result<Decimal> {
        let upper = currency.trim().to_uppercase();
        if USD_PEGGED.contains(&upper.as_str()) {
            return Ok(Decimal::ONE);
        }
        let rate = self
            .bounded(&format!("usd rate {upper}"), self.provider.usd_rate(&upper))
            .await?;
        if rate <= Decimal::ZERO {
            return Err(LedgerError::UpstreamUnavailable(format!("invalid usd rate for {upper}")));
        }
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quote_provider::testing::FixedQuotes;
    use crate::types::Quote;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct SlowQuotes;

    #[async_trait]
    impl QuoteProvider for SlowQuotes {
        async fn quote(&self, _symbol: &str) -> Result<Quote> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Quote::new(dec!(1), 0))
        }
        async fn historical_close(&self, _symbol: &str, _at: i64) -> Result<Decimal> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(dec!(1))
        }
        async fn usd_rate(&self, _currency: &str) -> Result<Decimal> {
            Ok(dec!(1))
        }
    }

    fn feed(provider: Arc<dyn QuoteProvider>) -> PriceFeed {
        let (cache, _rx) = QuoteCache::new();
        PriceFeed::new(cache, provider, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_cache_first_then_provider() {
        let feed = feed(Arc::new(FixedQuotes::default().with_price("BTC/USD", dec!(100))));
        assert_eq!(feed.current_price("BTC/USD").await.unwrap(), dec!(100));
        assert!(feed.cache().is_subscribed("btc/usd"));

        feed.cache().update("BTC/USD", dec!(101), 1);
        assert_eq!(feed.current_price("BTC/USD").await.unwrap(), dec!(101));
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let feed = feed(Arc::new(SlowQuotes));
        let err = feed.current_price("ETH/USD").await.unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamUnavailable(_)));
        let err = feed.expiry_price("ETH/USD", 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_stablecoins_are_pegged() {
        let feed = feed(Arc::new(FixedQuotes::default().with_price("BTC", dec!(60000))));
        assert_eq!(feed.usd_rate("usdt").await.unwrap(), Decimal::ONE);
        assert_eq!(feed.usd_rate("BTC").await.unwrap(), dec!(60000));
        assert!(feed.usd_rate("DOGE").await.is_err());
    }
}
