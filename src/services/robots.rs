//! AI-robot investment packages, orders and the daily distribution engine.

use crate::error::{LedgerError, Result};
use crate::services::context::LedgerContext;
use crate::services::ledger::{append_log, apply_change, BalanceChange};
use crate::services::scheduler::{BatchReport, Monitor};
use crate::services::sqlite_store as db;
use crate::types::{
    now_ms, round_money, RobotAction, RobotOrder, RobotOrderStatus, RobotPackage, TransactionEntry,
    TxCategory, TxKind,
};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Resolution of the random daily rate draw.
const RATE_STEPS: u32 = 1_000_000;

/// Uniform rate in `[min, max]`.
fn draw_rate(min: Decimal, max: Decimal, rng: &mut impl Rng) -> Decimal {
    if max <= min {
        return min;
    }
    let step = Decimal::from(rng.gen_range(0..=RATE_STEPS));
    round_money(min + (max - min) * step / Decimal::from(RATE_STEPS))
}

/// What one order did during a monitor pass.
enum RobotEvent {
    Distributed { profit: Decimal, total: Decimal },
    Completed,
}

pub struct RobotService {
    ctx: LedgerContext,
}

impl RobotService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub fn create_package(&self, package: RobotPackage) -> Result<RobotPackage> {
        if package.min_investment <= Decimal::ZERO || package.max_investment < package.min_investment {
            return Err(LedgerError::Validation("invalid investment bounds".to_string()));
        }
        if package.min_daily_return_pct < Decimal::ZERO
            || package.max_daily_return_pct < package.min_daily_return_pct
        {
            return Err(LedgerError::Validation("invalid daily return bounds".to_string()));
        }
        if package.cycle_days == 0 {
            return Err(LedgerError::Validation("cycle must be at least one day".to_string()));
        }
        self.ctx
            .store
            .with_conn(|c| db::insert_robot_package(c, &package))?;
        info!("Robot package {} ({}) created", package.name, package.id);
        Ok(package)
    }

    pub fn packages(&self, active_only: bool) -> Result<Vec<RobotPackage>> {
        self.ctx
            .store
            .with_conn(|c| db::list_robot_packages(c, active_only))
    }

    pub fn set_package_active(&self, package_id: &str, active: bool) -> Result<()> {
        if !self
            .ctx
            .store
            .with_conn(|c| db::set_robot_package_active(c, package_id, active))?
        {
            return Err(LedgerError::not_found("robot package", package_id));
        }
        Ok(())
    }

    /// Lock `amount` into a package. The running-order limit check, the
    /// reservation and the order insert commit together.
    pub async fn host_investment(
        &self,
        user_id: &str,
        package_id: &str,
        amount: Decimal,
        asset: &str,
    ) -> Result<RobotOrder> {
        let asset = asset.trim();
        if asset.is_empty() {
            return Err(LedgerError::Validation("asset is required".to_string()));
        }

        let order = self.ctx.store.with_transaction(|tx| {
            let package = db::get_robot_package(tx, package_id)?
                .filter(|p| p.is_active)
                .ok_or_else(|| LedgerError::not_found("robot package", package_id))?;
            if !package.accepts(amount) {
                return Err(LedgerError::Validation(format!(
                    "investment must be between {} and {}",
                    package.min_investment, package.max_investment
                )));
            }

            let account = db::require_account(tx, user_id)?;
            let running = db::count_robot_orders(tx, user_id, RobotOrderStatus::Running)?;
            if running >= account.robot_limit {
                return Err(LedgerError::InvalidState(format!(
                    "robot limit of {} running orders reached",
                    account.robot_limit
                )));
            }

            apply_change(tx, user_id, BalanceChange::Reserve(amount))?;
            let order = RobotOrder::host(&package, user_id.to_string(), amount, asset.to_string(), now_ms());
            db::insert_robot_order(tx, &order)?;
            append_log(
                tx,
                &TransactionEntry::new(
                    user_id,
                    amount,
                    TxKind::Debit,
                    TxCategory::AiRobotPurchase,
                    format!("AI robot {} on {}", package.name, order.asset),
                    Some(&order.id),
                ),
            )?;
            Ok(order)
        })?;

        info!(
            "Robot order {} hosted for {}: {} for {} days",
            order.id, user_id, amount, order.cycle_days
        );
        self.ctx
            .announce(
                user_id,
                format!("Your AI robot on {} is running with {}", order.asset, amount),
                None,
            )
            .await;
        Ok(order)
    }

    /// Return principal and profit of a Completed order.
    pub async fn redeem(&self, user_id: &str, order_id: &str) -> Result<RobotOrder> {
        let now = now_ms();
        let order = self.ctx.store.with_transaction(|tx| {
            let mut order = db::get_robot_order(tx, order_id)?
                .filter(|o| o.user_id == user_id)
                .ok_or_else(|| LedgerError::not_found("robot order", order_id))?;
            if order.status != RobotOrderStatus::Completed {
                return Err(LedgerError::InvalidState(format!(
                    "order {order_id} is {}, only Completed orders can be redeemed",
                    order.status
                )));
            }

            let amount = order.redemption_amount();
            apply_change(
                tx,
                user_id,
                BalanceChange::Settle {
                    locked: order.investment,
                    payout: amount,
                },
            )?;
            append_log(
                tx,
                &TransactionEntry::new(
                    user_id,
                    amount,
                    TxKind::Credit,
                    TxCategory::AiRobotRedemption,
                    format!("AI robot redemption from order {order_id}"),
                    Some(order_id),
                ),
            )?;

            order.status = RobotOrderStatus::Redeemed;
            order.redemption_date = Some(now);
            order.redeemed_amount = amount;
            if !db::update_robot_order(tx, &order, RobotOrderStatus::Completed)? {
                return Err(LedgerError::InvalidState(format!("order {order_id} changed concurrently")));
            }
            Ok(order)
        })?;

        info!("Robot order {} redeemed for {}", order.id, order.redeemed_amount);
        self.ctx
            .announce(
                user_id,
                format!("Your AI robot order was redeemed for {}", order.redeemed_amount),
                None,
            )
            .await;
        Ok(order)
    }

    pub fn orders(&self, user_id: &str, status: Option<RobotOrderStatus>) -> Result<Vec<RobotOrder>> {
        self.ctx
            .store
            .with_conn(|c| db::list_robot_orders(c, Some(user_id), status))
    }

    /// Distribute today's profit or complete the cycle for one order.
    fn advance_order(&self, order_id: &str, now: i64) -> Result<Option<(RobotOrder, RobotEvent)>> {
        self.ctx.store.with_transaction(|tx| {
            let Some(mut order) = db::get_robot_order(tx, order_id)? else {
                return Ok(None);
            };
            let event = match order.next_action(now) {
                RobotAction::Idle => return Ok(None),
                RobotAction::Distribute => {
                    let rate = draw_rate(
                        order.min_daily_return_pct,
                        order.max_daily_return_pct,
                        &mut rand::thread_rng(),
                    );
                    let profit = order.record_distribution(rate, now);
                    if profit > Decimal::ZERO {
                        apply_change(tx, &order.user_id, BalanceChange::Credit(profit))?;
                        append_log(
                            tx,
                            &TransactionEntry::new(
                                &order.user_id,
                                profit,
                                TxKind::Credit,
                                TxCategory::AiRobotProfit,
                                format!("AI robot daily profit at {rate}%"),
                                Some(&order.id),
                            ),
                        )?;
                    }
                    RobotEvent::Distributed {
                        profit,
                        total: order.total_profit,
                    }
                }
                RobotAction::Complete => {
                    order.status = RobotOrderStatus::Completed;
                    RobotEvent::Completed
                }
            };
            if !db::update_robot_order(tx, &order, RobotOrderStatus::Running)? {
                return Ok(None);
            }
            Ok(Some((order, event)))
        })
    }
}

#[async_trait]
impl Monitor for RobotService {
    fn name(&self) -> &'static str {
        "ai-robot"
    }

    async fn process_batch_at(&self, now: i64) -> Result<BatchReport> {
        let running = self
            .ctx
            .store
            .with_conn(|c| db::list_robot_orders(c, None, Some(RobotOrderStatus::Running)))?;

        let mut report = BatchReport::default();
        for order in running {
            report.processed += 1;
            if order.next_action(now) == RobotAction::Idle {
                report.skipped += 1;
                continue;
            }
            match self.advance_order(&order.id, now) {
                Ok(Some((order, RobotEvent::Distributed { profit, total }))) => {
                    report.settled += 1;
                    debug!("Robot order {} distributed {}", order.id, profit);
                    self.ctx
                        .announce(
                            &order.user_id,
                            format!("AI robot profited {profit} today. Total profit: {total}"),
                            None,
                        )
                        .await;
                }
                Ok(Some((order, RobotEvent::Completed))) => {
                    report.settled += 1;
                    info!("Robot order {} completed its {}-day cycle", order.id, order.cycle_days);
                    self.ctx
                        .announce(
                            &order.user_id,
                            format!("Your AI robot completed its {}-day cycle", order.cycle_days),
                            None,
                        )
                        .await;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Robot order {} failed: {}", order.id, e);
                }
            }
        }
        Ok(report)
    }
}
