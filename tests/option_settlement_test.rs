//! Binary-option placement and expiry settlement.

mod common;

use common::Harness;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tradeledger::services::OptionService;
use tradeledger::types::{AdminOutcome, OptionDirection, OptionStatus, TradeOutcome};

fn with_eighty_percent_table(h: &Harness) {
    h.update_settings(|s| {
        s.option_profit_rates.insert(60, dec!(80));
    });
}

#[tokio::test]
async fn test_forced_profit_pays_stake_plus_return() {
    let h = Harness::new();
    with_eighty_percent_table(&h);
    h.quotes.set("BTC/USD", dec!(30000));
    h.fund("alice", dec!(500));
    let options = OptionService::new(h.ctx.clone());

    let trade = options
        .place_trade("alice", "BTC/USD", 60, dec!(100), OptionDirection::Bearish)
        .await
        .unwrap();
    assert_eq!(h.balances("alice"), (dec!(400), dec!(100), Decimal::ZERO));

    options
        .set_admin_outcome(&trade.id, Some(AdminOutcome::Profit))
        .unwrap();
    // A forced outcome still waits for an expiry price.
    h.quotes.outage("BTC/USD");
    let report = options
        .resolve_expired(Some("alice"), trade.expiry_time + 1)
        .await
        .unwrap();
    assert_eq!(report.settled, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.balances("alice"), (dec!(400), dec!(100), Decimal::ZERO));

    h.quotes.set("BTC/USD", dec!(30500));
    let report = options
        .resolve_expired(Some("alice"), trade.expiry_time + 2)
        .await
        .unwrap();
    assert_eq!(report.settled, 1);

    let (available, locked, _) = h.balances("alice");
    assert_eq!(available, dec!(580));
    assert_eq!(locked, Decimal::ZERO);

    let settled = options.list_trades("alice", 10).await.unwrap().remove(0);
    assert_eq!(settled.status, OptionStatus::ExpiredWin);
    assert_eq!(settled.outcome, Some(TradeOutcome::Win));
    assert_eq!(settled.payout, Some(dec!(180)));
    // Displayed price is nudged in the winning direction.
    assert!(settled.expiry_price.unwrap() < settled.opening_price);
}

#[tokio::test]
async fn test_market_win_is_balance_neutral_but_for_payout() {
    let h = Harness::new();
    with_eighty_percent_table(&h);
    h.quotes.set("ETH/USD", dec!(2000));
    h.fund("bob", dec!(250));
    let options = OptionService::new(h.ctx.clone());

    let trade = options
        .place_trade("bob", "ETH/USD", 60, dec!(50), OptionDirection::Bullish)
        .await
        .unwrap();
    h.quotes.set("ETH/USD", dec!(2010));

    options
        .resolve_expired(Some("bob"), trade.expiry_time)
        .await
        .unwrap();

    // available_after = available_before - stake + payout
    let (available, locked, _) = h.balances("bob");
    assert_eq!(available, dec!(250) - dec!(50) + dec!(90));
    assert_eq!(locked, Decimal::ZERO);
}

#[tokio::test]
async fn test_expiry_without_price_stays_active() {
    let h = Harness::new();
    with_eighty_percent_table(&h);
    h.quotes.set("SOL/USD", dec!(20));
    h.fund("carol", dec!(100));
    let options = OptionService::new(h.ctx.clone());
    let trade = options
        .place_trade("carol", "SOL/USD", 60, dec!(10), OptionDirection::Bullish)
        .await
        .unwrap();

    h.quotes.outage("SOL/USD");
    let report = options
        .resolve_expired(None, trade.expiry_time + 1)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.balances("carol"), (dec!(90), dec!(10), Decimal::ZERO));

    // Next cycle, price is back.
    h.quotes.set("SOL/USD", dec!(19));
    let report = options
        .resolve_expired(None, trade.expiry_time + 2)
        .await
        .unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(h.balances("carol"), (dec!(90), Decimal::ZERO, Decimal::ZERO));
}

#[tokio::test]
async fn test_concurrent_resolution_settles_once() {
    let h = Harness::new();
    with_eighty_percent_table(&h);
    h.quotes.set("BTC/USD", dec!(100));
    h.fund("dave", dec!(100));
    let options = OptionService::new(h.ctx.clone());
    let trade = options
        .place_trade("dave", "BTC/USD", 60, dec!(100), OptionDirection::Bullish)
        .await
        .unwrap();
    options
        .set_admin_outcome(&trade.id, Some(AdminOutcome::Profit))
        .unwrap();

    let (first, second) = tokio::join!(options.settle_trade(&trade), options.settle_trade(&trade));
    let settled = [first.unwrap(), second.unwrap()];
    assert_eq!(settled.iter().filter(|s| **s).count(), 1);

    assert_eq!(h.balances("dave"), (dec!(180), Decimal::ZERO, Decimal::ZERO));
    let log = h.ctx.ledger.transactions("dave", 10).unwrap();
    let settlement_rows = log
        .iter()
        .filter(|e| e.reference_id.as_deref() == Some(trade.id.as_str()))
        .count();
    assert_eq!(settlement_rows, 1);
}

#[tokio::test]
async fn test_settlement_reaches_admin_feed() {
    let h = Harness::new();
    with_eighty_percent_table(&h);
    h.quotes.set("BTC/USD", dec!(100));
    h.fund("erin", dec!(100));
    let options = OptionService::new(h.ctx.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = h.registry.register("admin", tx);
    h.registry.subscribe_admin(conn, Some("erin".to_string()));

    let trade = options
        .place_trade("erin", "BTC/USD", 60, dec!(10), OptionDirection::Bullish)
        .await
        .unwrap();
    options
        .set_admin_outcome(&trade.id, Some(AdminOutcome::Loss))
        .unwrap();
    options
        .resolve_expired(Some("erin"), trade.expiry_time)
        .await
        .unwrap();

    let placed: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(placed["type"], "trade_placed");
    let settled: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(settled["type"], "trade_settled");
    assert_eq!(settled["outcome"], "loss");

    let inbox = h.notifier.inbox("erin");
    assert_eq!(inbox.len(), 2);
    h.assert_non_negative("erin");
}
