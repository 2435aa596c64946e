use crate::types::{normalize_symbol, Quote};
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Latest streamed price per symbol.
///
/// Entries carry no TTL. Callers fall back to a direct quote fetch only when
/// a symbol has no entry at all, not when it is merely old.
pub struct QuoteCache {
    prices: DashMap<String, Quote>,
    subscribed: DashSet<String>,
    /// New subscriptions for the streaming task.
    subscribe_tx: mpsc::UnboundedSender<String>,
}

impl QuoteCache {
    /// Create a new cache and the receiver the stream reads subscriptions from.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            prices: DashMap::new(),
            subscribed: DashSet::new(),
            subscribe_tx,
        });
        (cache, subscribe_rx)
    }

    /// Start streaming `symbol`. Repeated calls are no-ops.
    pub fn subscribe(&self, symbol: &str) {
        let symbol = normalize_symbol(symbol);
        if self.subscribed.insert(symbol.clone()) {
            debug!("Subscribing to {}", symbol);
            // Receiver gone means no stream is running; the set still
            // remembers the symbol for the next connection.
            let _ = self.subscribe_tx.send(symbol);
        }
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.contains(&normalize_symbol(symbol))
    }

    /// Everything ever subscribed, for resubscription after a reconnect.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed.iter().map(|s| s.key().clone()).collect()
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.get_quote(symbol).map(|q| q.price)
    }

    pub fn get_quote(&self, symbol: &str) -> Option<Quote> {
        self.prices.get(&normalize_symbol(symbol)).map(|q| *q)
    }

    /// Record a streamed price.
    pub fn update(&self, symbol: &str, price: Decimal, timestamp: i64) {
        if price <= Decimal::ZERO {
            return;
        }
        self.prices
            .insert(normalize_symbol(symbol), Quote::new(price, timestamp));
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_is_idempotent() {
        let (cache, mut rx) = QuoteCache::new();
        cache.subscribe("btc/usd");
        cache.subscribe("BTC/USD");
        cache.subscribe(" btc/usd ");

        assert_eq!(rx.try_recv().unwrap(), "BTC/USD");
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.subscribed_symbols(), vec!["BTC/USD".to_string()]);
    }

    #[test]
    fn test_get_after_update() {
        let (cache, _rx) = QuoteCache::new();
        assert_eq!(cache.get("ETH/USD"), None);

        cache.update("eth/usd", dec!(3000.5), 1_000);
        assert_eq!(cache.get("ETH/USD"), Some(dec!(3000.5)));
        assert_eq!(cache.get_quote("ETH/USD").unwrap().timestamp, 1_000);
    }

    #[test]
    fn test_ignores_non_positive_prices() {
        let (cache, _rx) = QuoteCache::new();
        cache.update("X", Decimal::ZERO, 1);
        assert!(cache.is_empty());
    }
}
