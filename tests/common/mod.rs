//! Shared harness for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tradeledger::error::{LedgerError, Result};
use tradeledger::services::{
    LedgerContext, PriceFeed, QuoteCache, QuoteProvider, SqliteStore, StoreNotifier,
};
use tradeledger::types::{Quote, SiteSettings, TxCategory};
use tradeledger::websocket::ConnectionRegistry;

pub const DAY: i64 = 86_400_000;

/// In-process quote provider whose prices the test moves by hand. A symbol
/// with no price is reported unavailable.
#[derive(Default)]
pub struct ScriptedQuotes {
    prices: DashMap<String, Decimal>,
}

impl ScriptedQuotes {
    pub fn set(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_uppercase(), price);
    }

    pub fn outage(&self, symbol: &str) {
        self.prices.remove(&symbol.to_uppercase());
    }

    fn lookup(&self, symbol: &str) -> Result<Decimal> {
        self.prices
            .get(&symbol.to_uppercase())
            .map(|p| *p)
            .ok_or_else(|| LedgerError::UpstreamUnavailable(format!("no price for {symbol}")))
    }
}

#[async_trait]
impl QuoteProvider for ScriptedQuotes {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        self.lookup(symbol).map(|price| Quote::new(price, 0))
    }

    async fn historical_close(&self, symbol: &str, _at_or_before_ms: i64) -> Result<Decimal> {
        self.lookup(symbol)
    }

    async fn usd_rate(&self, currency: &str) -> Result<Decimal> {
        self.lookup(currency)
    }
}

pub struct Harness {
    pub ctx: LedgerContext,
    pub quotes: Arc<ScriptedQuotes>,
    pub notifier: Arc<StoreNotifier>,
    pub registry: Arc<ConnectionRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let quotes = Arc::new(ScriptedQuotes::default());
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let (cache, _subscriptions) = QuoteCache::new();
        let prices = PriceFeed::new(cache, quotes.clone(), Duration::from_millis(500));
        let notifier = Arc::new(StoreNotifier::new(store.clone()));
        let registry = ConnectionRegistry::new();
        let ctx = LedgerContext::new(store, prices, notifier.clone(), registry.clone());
        Self {
            ctx,
            quotes,
            notifier,
            registry,
        }
    }

    /// Open `user_id` with `amount` available.
    pub fn fund(&self, user_id: &str, amount: Decimal) {
        self.ctx.ledger.ensure_account(user_id).unwrap();
        if amount > Decimal::ZERO {
            self.ctx
                .ledger
                .credit(user_id, amount, TxCategory::Deposit, "seed", None)
                .unwrap();
        }
    }

    pub fn update_settings(&self, edit: impl FnOnce(&mut SiteSettings)) {
        self.ctx
            .update_settings(|settings| {
                edit(settings);
                Ok(())
            })
            .unwrap();
    }

    /// (available, locked, loan)
    pub fn balances(&self, user_id: &str) -> (Decimal, Decimal, Decimal) {
        let acc = self.ctx.ledger.account(user_id).unwrap();
        (acc.available, acc.locked, acc.loan)
    }

    pub fn assert_non_negative(&self, user_id: &str) {
        let (available, locked, loan) = self.balances(user_id);
        assert!(available >= Decimal::ZERO, "available went negative: {available}");
        assert!(locked >= Decimal::ZERO, "locked went negative: {locked}");
        assert!(loan >= Decimal::ZERO, "loan aggregate went negative: {loan}");
    }
}
