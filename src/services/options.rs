//! Binary-option placement and settlement.
//!
//! Resolution is lazy: expired trades are settled the next time their owner
//! places a trade or reads history, or by the optional sweep. Settlement runs
//! the guarded `Active -> Expired_*` transition and the ledger movement in one
//! write transaction, so a trade resolved twice concurrently settles once.

use crate::error::{LedgerError, Result};
use crate::services::context::LedgerContext;
use crate::services::ledger::{append_log, apply_change, BalanceChange};
use crate::services::scheduler::{BatchReport, Monitor};
use crate::services::sqlite_store as db;
use crate::types::{
    normalize_symbol, now_ms, AdminOutcome, LedgerEvent, OptionDirection, OptionResolution,
    OptionStatus, OptionTrade, TradeOutcome, TransactionEntry, TxCategory, TxKind,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

pub struct OptionService {
    ctx: LedgerContext,
}

impl OptionService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Place a wager: reserve the stake, price it, then record it.
    pub async fn place_trade(
        &self,
        user_id: &str,
        symbol: &str,
        duration_secs: u64,
        stake: Decimal,
        direction: OptionDirection,
    ) -> Result<OptionTrade> {
        if stake <= Decimal::ZERO {
            return Err(LedgerError::Validation("stake must be positive".to_string()));
        }
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(LedgerError::Validation("symbol is required".to_string()));
        }
        let return_percentage = self.ctx.settings()?.option_return(duration_secs).ok_or_else(|| {
            LedgerError::Validation(format!("no return rate configured for {duration_secs}s"))
        })?;

        let now = now_ms();
        if let Err(e) = self.resolve_expired(Some(user_id), now).await {
            warn!("Lazy resolution for {} failed: {}", user_id, e);
        }

        self.ctx.ledger.reserve(user_id, stake)?;

        let opening_price = match self.ctx.prices.current_price(&symbol).await {
            Ok(price) => price,
            Err(e) => {
                self.ctx.refund(user_id, stake, "option placement").await;
                return Err(e);
            }
        };

        let trade = OptionTrade::new(
            user_id.to_string(),
            symbol,
            direction,
            stake,
            opening_price,
            now,
            duration_secs,
            return_percentage,
        );
        if let Err(e) = self.ctx.store.with_conn(|c| db::insert_option_trade(c, &trade)) {
            self.ctx.refund(user_id, stake, "option placement").await;
            return Err(e);
        }

        info!(
            "Option {} placed: {} {} {} at {} for {}s",
            trade.id, user_id, trade.direction, trade.symbol, trade.opening_price, duration_secs
        );
        self.ctx
            .announce(
                user_id,
                format!("Your {} trade of {} on {} is live", trade.direction, stake, trade.symbol),
                Some(LedgerEvent::TradePlaced {
                    trade_id: trade.id.clone(),
                    user_id: user_id.to_string(),
                    symbol: trade.symbol.clone(),
                    direction: trade.direction,
                    stake,
                    expiry_time: trade.expiry_time,
                }),
            )
            .await;
        Ok(trade)
    }

    /// Add to the stake of a live trade. The reservation and the stake bump
    /// commit together or not at all.
    pub fn add_investment(&self, user_id: &str, trade_id: &str, amount: Decimal) -> Result<OptionTrade> {
        let now = now_ms();
        let trade = self.ctx.store.with_transaction(|tx| {
            let mut trade = owned_trade(tx, user_id, trade_id)?;
            if trade.status != OptionStatus::Active || trade.is_expired(now) {
                return Err(LedgerError::InvalidState(format!("trade {trade_id} is no longer active")));
            }
            apply_change(tx, user_id, BalanceChange::Reserve(amount))?;
            let stake = trade.stake + amount;
            if !db::update_option_stake(tx, trade_id, trade.stake, stake)? {
                return Err(LedgerError::InvalidState(format!("trade {trade_id} changed concurrently")));
            }
            trade.stake = stake;
            Ok(trade)
        })?;
        info!("Added {} to option {} (stake now {})", amount, trade_id, trade.stake);
        Ok(trade)
    }

    /// Trade history, newest first. Expired trades are settled first.
    pub async fn list_trades(&self, user_id: &str, limit: usize) -> Result<Vec<OptionTrade>> {
        if let Err(e) = self.resolve_expired(Some(user_id), now_ms()).await {
            warn!("Lazy resolution for {} failed: {}", user_id, e);
        }
        self.ctx
            .store
            .with_conn(|c| db::list_option_trades(c, user_id, limit))
    }

    /// Settle every Active trade that expired at or before `now`, for one
    /// user or everyone.
    pub async fn resolve_expired(&self, user_id: Option<&str>, now: i64) -> Result<BatchReport> {
        let expired = self
            .ctx
            .store
            .with_conn(|c| db::list_expired_active_trades(c, user_id, now))?;

        let mut report = BatchReport::default();
        for trade in expired {
            report.processed += 1;
            match self.settle_trade(&trade).await {
                Ok(true) => report.settled += 1,
                Ok(false) => report.skipped += 1,
                Err(LedgerError::UpstreamUnavailable(e)) => {
                    debug!("No expiry price for {} yet: {}", trade.id, e);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("Failed to settle option {}: {}", trade.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Settle one expired trade. Returns false when another writer already
    /// resolved it; a missing expiry price surfaces as `UpstreamUnavailable`.
    pub async fn settle_trade(&self, trade: &OptionTrade) -> Result<bool> {
        // Forced outcomes still wait for an expiry price; the trade stays
        // Active for this cycle when none is available.
        let market_price = self.ctx.prices.expiry_price(&trade.symbol, trade.expiry_time).await?;

        let settled = self.ctx.store.with_transaction(|tx| {
            // Re-read under the write lock: the stake or override may have
            // changed since the batch was listed.
            let Some(fresh) = db::get_option_trade(tx, &trade.id)? else {
                return Ok(None);
            };
            if fresh.status != OptionStatus::Active {
                return Ok(None);
            }
            let resolution = fresh.resolve(market_price, rand::random::<bool>);
            if !db::resolve_option_trade(tx, &fresh.id, &resolution)? {
                return Ok(None);
            }
            apply_change(
                tx,
                &fresh.user_id,
                BalanceChange::Settle {
                    locked: fresh.stake,
                    payout: resolution.payout,
                },
            )?;
            append_log(tx, &settlement_entry(&fresh, &resolution))?;
            Ok(Some((fresh, resolution)))
        })?;

        let Some((trade, resolution)) = settled else {
            debug!("Option {} already resolved, skipping", trade.id);
            return Ok(false);
        };

        info!(
            "Option {} settled {}: expiry {} payout {}",
            trade.id, resolution.outcome, resolution.expiry_price, resolution.payout
        );
        let message = match resolution.outcome {
            TradeOutcome::Win => format!("Your {} trade won {}", trade.symbol, resolution.payout),
            TradeOutcome::Loss => format!("Your {} trade expired with a loss", trade.symbol),
        };
        self.ctx
            .announce(
                &trade.user_id,
                message,
                Some(LedgerEvent::TradeSettled {
                    trade_id: trade.id.clone(),
                    user_id: trade.user_id.clone(),
                    outcome: resolution.outcome,
                    payout: resolution.payout,
                    expiry_price: resolution.expiry_price,
                }),
            )
            .await;
        Ok(true)
    }

    /// Force (or clear) the outcome of a live trade.
    pub fn set_admin_outcome(&self, trade_id: &str, outcome: Option<AdminOutcome>) -> Result<OptionTrade> {
        self.ctx.store.with_transaction(|tx| {
            let trade = db::get_option_trade(tx, trade_id)?
                .ok_or_else(|| LedgerError::not_found("option trade", trade_id))?;
            if !db::set_option_admin_outcome(tx, trade_id, outcome.map(|o| o.as_str()))? {
                return Err(LedgerError::InvalidState(format!(
                    "trade {trade_id} is already {}",
                    trade.status
                )));
            }
            info!("Admin outcome for option {} set to {:?}", trade_id, outcome);
            Ok(OptionTrade {
                admin_outcome: outcome,
                ..trade
            })
        })
    }
}

#[async_trait]
impl Monitor for OptionService {
    fn name(&self) -> &'static str {
        "option-sweep"
    }

    async fn process_batch_at(&self, now: i64) -> Result<BatchReport> {
        self.resolve_expired(None, now).await
    }
}

fn owned_trade(conn: &rusqlite::Connection, user_id: &str, trade_id: &str) -> Result<OptionTrade> {
    db::get_option_trade(conn, trade_id)?
        .filter(|t| t.user_id == user_id)
        .ok_or_else(|| LedgerError::not_found("option trade", trade_id))
}

/// A win logs the payout credited, a loss logs the forfeited stake.
fn settlement_entry(trade: &OptionTrade, resolution: &OptionResolution) -> TransactionEntry {
    let (amount, kind) = match resolution.outcome {
        TradeOutcome::Win => (resolution.payout, TxKind::Credit),
        TradeOutcome::Loss => (trade.stake, TxKind::Debit),
    };
    TransactionEntry::new(
        &trade.user_id,
        amount,
        kind,
        TxCategory::Trading,
        format!("{} {} option {}", trade.symbol, trade.direction, resolution.outcome),
        Some(&trade.id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{context_with, fund};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_place_reserves_stake() {
        let (ctx, _quotes) = context_with(&[("BTC/USD", dec!(100))]);
        fund(&ctx, "u", dec!(500));
        let service = OptionService::new(ctx.clone());

        let trade = service
            .place_trade("u", "btc/usd", 120, dec!(100), OptionDirection::Bullish)
            .await
            .unwrap();
        assert_eq!(trade.return_percentage, dec!(92));
        assert_eq!(trade.opening_price, dec!(100));
        assert_eq!(trade.expiry_time - trade.purchase_time, 120_000);

        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.available, dec!(400));
        assert_eq!(acc.locked, dec!(100));
    }

    #[tokio::test]
    async fn test_unconfigured_duration_is_rejected() {
        let (ctx, _quotes) = context_with(&[("BTC/USD", dec!(100))]);
        fund(&ctx, "u", dec!(500));
        let service = OptionService::new(ctx.clone());

        let err = service
            .place_trade("u", "BTC/USD", 7, dec!(10), OptionDirection::Bullish)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(ctx.ledger.account("u").unwrap().available, dec!(500));
    }

    #[tokio::test]
    async fn test_price_outage_refunds_reservation() {
        let (ctx, _quotes) = context_with(&[]);
        fund(&ctx, "u", dec!(50));
        let service = OptionService::new(ctx.clone());

        let err = service
            .place_trade("u", "NOPE/USD", 120, dec!(50), OptionDirection::Bearish)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UpstreamUnavailable(_)));

        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.available, dec!(50));
        assert_eq!(acc.locked, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_market_loss_logs_stake() {
        let (ctx, quotes) = context_with(&[("ETH/USD", dec!(100))]);
        fund(&ctx, "u", dec!(100));
        let service = OptionService::new(ctx.clone());
        let trade = service
            .place_trade("u", "ETH/USD", 120, dec!(40), OptionDirection::Bullish)
            .await
            .unwrap();

        // Unchanged price is a loss for both directions.
        quotes.historical.insert("ETH/USD".to_string(), dec!(100));
        let report = service
            .resolve_expired(Some("u"), trade.expiry_time + 1)
            .await
            .unwrap();
        assert_eq!(report.settled, 1);

        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.available, dec!(60));
        assert_eq!(acc.locked, Decimal::ZERO);

        let log = ctx.ledger.transactions("u", 1).unwrap();
        assert_eq!(log[0].kind, TxKind::Debit);
        assert_eq!(log[0].amount, dec!(40));
        assert_eq!(log[0].reference_id.as_deref(), Some(trade.id.as_str()));
    }

    #[tokio::test]
    async fn test_add_investment_on_live_trade() {
        let (ctx, _quotes) = context_with(&[("BTC/USD", dec!(100))]);
        fund(&ctx, "u", dec!(100));
        let service = OptionService::new(ctx.clone());
        let trade = service
            .place_trade("u", "BTC/USD", 300, dec!(30), OptionDirection::Bullish)
            .await
            .unwrap();

        let updated = service.add_investment("u", &trade.id, dec!(20)).unwrap();
        assert_eq!(updated.stake, dec!(50));
        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.locked, dec!(50));

        let err = service.add_investment("u", &trade.id, dec!(100)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        let err = service.add_investment("other", &trade.id, dec!(1)).unwrap_err();
        assert!(matches!(err, LedgerError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_admin_outcome_only_on_active_trades() {
        let (ctx, _quotes) = context_with(&[("BTC/USD", dec!(100))]);
        fund(&ctx, "u", dec!(100));
        let service = OptionService::new(ctx.clone());
        let trade = service
            .place_trade("u", "BTC/USD", 120, dec!(10), OptionDirection::Bearish)
            .await
            .unwrap();

        let forced = service
            .set_admin_outcome(&trade.id, Some(AdminOutcome::Loss))
            .unwrap();
        assert_eq!(forced.admin_outcome, Some(AdminOutcome::Loss));

        service
            .resolve_expired(None, trade.expiry_time)
            .await
            .unwrap();
        let err = service
            .set_admin_outcome(&trade.id, Some(AdminOutcome::Profit))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
        assert!(matches!(
            service.set_admin_outcome("missing", None).unwrap_err(),
            LedgerError::EntityNotFound { .. }
        ));
    }
}
