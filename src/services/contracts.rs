//! Leveraged contract positions and the trigger monitor.

use crate::error::{LedgerError, Result};
use crate::services::context::LedgerContext;
use crate::services::ledger::{append_log, apply_change, BalanceChange};
use crate::services::scheduler::{BatchReport, Monitor};
use crate::services::sqlite_store as db;
use crate::types::{
    normalize_symbol, now_ms, CloseTrigger, ContractPosition, ContractSettlement, ContractSide,
    LedgerEvent, NotificationLevel, PositionStatus, TransactionEntry, TxCategory, ADMIN_INBOX,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Open position with a mark-to-market snapshot. Price fields are absent
/// when no quote was available.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    #[serde(flatten)]
    pub position: ContractPosition,
    pub current_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

pub struct ContractService {
    ctx: LedgerContext,
}

impl ContractService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        user_id: &str,
        symbol: &str,
        side: ContractSide,
        quantity: Decimal,
        leverage: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<ContractPosition> {
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::Validation("quantity must be positive".to_string()));
        }
        if leverage < Decimal::ONE {
            return Err(LedgerError::Validation("leverage must be at least 1".to_string()));
        }
        validate_targets(take_profit, stop_loss)?;
        let symbol = normalize_symbol(symbol);
        let settings = self.ctx.settings()?;

        let opening_price = self.ctx.prices.current_price(&symbol).await?;
        let position = ContractPosition::open(
            user_id.to_string(),
            symbol,
            side,
            quantity,
            leverage,
            opening_price,
            settings.maintenance_margin,
            take_profit,
            stop_loss,
            now_ms(),
        )?;

        self.ctx.ledger.reserve(user_id, position.margin_used)?;
        if let Err(e) = self.ctx.store.with_conn(|c| db::insert_position(c, &position)) {
            self.ctx
                .refund(user_id, position.margin_used, "position open")
                .await;
            return Err(e);
        }

        info!(
            "Position {} opened: {} {} {} x{} at {} (margin {}, liquidation {})",
            position.id,
            user_id,
            side,
            position.symbol,
            leverage,
            opening_price,
            position.margin_used,
            position.liquidation_price
        );
        self.ctx
            .announce(
                user_id,
                format!("{} {} position opened at {}", side, position.symbol, opening_price),
                Some(LedgerEvent::PositionOpened {
                    position_id: position.id.clone(),
                    user_id: user_id.to_string(),
                    symbol: position.symbol.clone(),
                    side,
                    margin: position.margin_used,
                }),
            )
            .await;
        Ok(position)
    }

    /// Replace the take-profit, the stop-loss, or both. A target that is not
    /// given keeps its stored value.
    pub fn update_tp_sl(
        &self,
        user_id: &str,
        position_id: &str,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<ContractPosition> {
        if take_profit.is_none() && stop_loss.is_none() {
            return Err(LedgerError::Validation(
                "a take-profit or stop-loss price is required".to_string(),
            ));
        }
        validate_targets(take_profit, stop_loss)?;
        self.ctx.store.with_transaction(|tx| {
            let position = owned_position(tx, user_id, position_id)?;
            let take_profit = take_profit.or(position.take_profit_price);
            let stop_loss = stop_loss.or(position.stop_loss_price);
            if !db::update_position_targets(tx, position_id, take_profit, stop_loss)? {
                return Err(LedgerError::InvalidState(format!(
                    "position {position_id} is already {}",
                    position.status
                )));
            }
            Ok(ContractPosition {
                take_profit_price: take_profit,
                stop_loss_price: stop_loss,
                ..position
            })
        })
    }

    /// User-initiated close at the current price.
    pub async fn close_position(&self, user_id: &str, position_id: &str) -> Result<ContractPosition> {
        let position = self
            .ctx
            .store
            .with_conn(|c| owned_position(c, user_id, position_id))?;
        if position.status != PositionStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "position {position_id} is already {}",
                position.status
            )));
        }
        let price = self.ctx.prices.current_price(&position.symbol).await?;
        self.settle(&position, price, CloseTrigger::Manual, now_ms())
            .await?
            .ok_or_else(|| LedgerError::InvalidState(format!("position {position_id} was closed concurrently")))
    }

    pub async fn open_positions(&self, user_id: &str) -> Result<Vec<PositionView>> {
        let positions = self
            .ctx
            .store
            .with_conn(|c| db::list_open_positions(c, Some(user_id)))?;

        let mut views = Vec::with_capacity(positions.len());
        for position in positions {
            let current_price = self.ctx.prices.current_price(&position.symbol).await.ok();
            views.push(PositionView {
                unrealized_pnl: current_price.and_then(|p| position.pnl_at(p).ok()),
                current_price,
                position,
            });
        }
        Ok(views)
    }

    pub fn closed_positions(&self, user_id: &str) -> Result<Vec<ContractPosition>> {
        self.ctx
            .store
            .with_conn(|c| db::list_closed_positions(c, user_id))
    }

    /// Close `position` at `price`. Returns `None` if another writer closed
    /// it first.
    pub async fn settle(
        &self,
        position: &ContractPosition,
        price: Decimal,
        trigger: CloseTrigger,
        now: i64,
    ) -> Result<Option<ContractPosition>> {
        let fee_pct = self.ctx.settings()?.contract_closing_fee_pct;

        let closed = self.ctx.store.with_transaction(|tx| {
            let Some(fresh) = db::get_position(tx, &position.id)? else {
                return Ok(None);
            };
            if fresh.status != PositionStatus::Open {
                return Ok(None);
            }
            let settlement = fresh.settlement(price, trigger, fee_pct)?;
            let status = trigger.final_status();
            if !db::close_position(tx, &fresh.id, status, price, now, settlement.realized_pnl)? {
                return Ok(None);
            }
            let applied = apply_change(
                tx,
                &fresh.user_id,
                BalanceChange::Settle {
                    locked: settlement.released,
                    payout: settlement.credit,
                },
            )?;
            let net = settlement.credit + applied.shortfall;
            if let Some(entry) = TransactionEntry::for_delta(
                &fresh.user_id,
                net,
                TxCategory::Contract,
                format!("{} {} position closed by {}", fresh.symbol, fresh.side, trigger),
                Some(&fresh.id),
            ) {
                append_log(tx, &entry)?;
            }
            let closed = ContractPosition {
                status,
                closing_price: Some(price),
                closing_time: Some(now),
                realized_pnl: Some(settlement.realized_pnl),
                ..fresh
            };
            Ok(Some((closed, settlement, applied.shortfall)))
        })?;

        let Some((closed, settlement, shortfall)) = closed else {
            debug!("Position {} already closed, skipping", position.id);
            return Ok(None);
        };

        self.after_close(&closed, &settlement, shortfall).await;
        Ok(Some(closed))
    }

    async fn after_close(&self, closed: &ContractPosition, settlement: &ContractSettlement, shortfall: Decimal) {
        info!(
            "Position {} {} at {}: pnl {} fee {} credit {}",
            closed.id, settlement.trigger, settlement.closing_price, settlement.realized_pnl, settlement.fee, settlement.credit
        );
        if shortfall > Decimal::ZERO {
            warn!("Position {} left an uncovered loss of {}", closed.id, shortfall);
            self.ctx
                .notifier
                .notify(
                    ADMIN_INBOX,
                    NotificationLevel::Warning,
                    format!(
                        "Position {} for {} closed with uncovered loss {}",
                        closed.id, closed.user_id, shortfall
                    ),
                )
                .await;
        }
        let message = match settlement.trigger {
            CloseTrigger::Liquidation => format!("Your {} position was liquidated", closed.symbol),
            trigger => format!(
                "Your {} position closed by {} with P&L {}",
                closed.symbol, trigger, settlement.realized_pnl
            ),
        };
        self.ctx
            .announce(
                &closed.user_id,
                message,
                Some(LedgerEvent::PositionClosed {
                    position_id: closed.id.clone(),
                    user_id: closed.user_id.clone(),
                    trigger: settlement.trigger,
                    closing_price: settlement.closing_price,
                    realized_pnl: settlement.realized_pnl,
                }),
            )
            .await;
    }
}

#[async_trait]
impl Monitor for ContractService {
    fn name(&self) -> &'static str {
        "contract"
    }

    /// Check every Open position against its thresholds. A missing price
    /// skips the position; it is never closed on a data outage.
    async fn process_batch_at(&self, now: i64) -> Result<BatchReport> {
        let positions = self
            .ctx
            .store
            .with_conn(|c| db::list_open_positions(c, None))?;

        let mut report = BatchReport::default();
        for position in positions {
            report.processed += 1;
            let price = match self.ctx.prices.current_price(&position.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    debug!("No price for position {}: {}", position.id, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let Some(trigger) = position.check_triggers(price) else {
                report.skipped += 1;
                continue;
            };
            match self.settle(&position, price, trigger, now).await {
                Ok(Some(_)) => report.settled += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("Failed to close position {} ({}): {}", position.id, trigger, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

fn validate_targets(take_profit: Option<Decimal>, stop_loss: Option<Decimal>) -> Result<()> {
    if take_profit.is_some_and(|p| p <= Decimal::ZERO) || stop_loss.is_some_and(|p| p <= Decimal::ZERO) {
        return Err(LedgerError::Validation(
            "take-profit and stop-loss must be positive".to_string(),
        ));
    }
    Ok(())
}

fn owned_position(conn: &rusqlite::Connection, user_id: &str, position_id: &str) -> Result<ContractPosition> {
    db::get_position(conn, position_id)?
        .filter(|p| p.user_id == user_id)
        .ok_or_else(|| LedgerError::not_found("position", position_id))
}
