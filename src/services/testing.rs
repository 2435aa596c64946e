//! Fixtures shared by the service unit tests.

use crate::services::context::LedgerContext;
use crate::services::notifier::StoreNotifier;
use crate::services::price_feed::PriceFeed;
use crate::services::quote_cache::QuoteCache;
use crate::services::quote_provider::testing::FixedQuotes;
use crate::services::sqlite_store::SqliteStore;
use crate::websocket::ConnectionRegistry;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// In-memory context whose provider quotes `prices`. The returned handle
/// lets a test change prices or take the provider offline.
pub fn context_with(prices: &[(&str, Decimal)]) -> (LedgerContext, Arc<FixedQuotes>) {
    let quotes = Arc::new(
        prices
            .iter()
            .fold(FixedQuotes::default(), |q, (symbol, price)| q.with_price(symbol, *price)),
    );
    let store = Arc::new(SqliteStore::new_in_memory().expect("in-memory store"));
    let (cache, _subscriptions) = QuoteCache::new();
    let feed = PriceFeed::new(cache, quotes.clone(), Duration::from_millis(200));
    let notifier = Arc::new(StoreNotifier::new(store.clone()));
    let ctx = LedgerContext::new(store, feed, notifier, ConnectionRegistry::new());
    (ctx, quotes)
}

/// Open an account for `user_id` holding `amount` available.
pub fn fund(ctx: &LedgerContext, user_id: &str, amount: Decimal) {
    ctx.ledger.ensure_account(user_id).expect("account");
    if amount > Decimal::ZERO {
        ctx.ledger
            .credit(user_id, amount, crate::types::TxCategory::Deposit, "test deposit", None)
            .expect("credit");
    }
}
