//! AI-robot investment packages and orders.

use super::{new_id, round_money, utc_day};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 86_400_000;

/// Admin-defined investment product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotPackage {
    pub id: String,
    pub name: String,
    pub min_investment: Decimal,
    pub max_investment: Decimal,
    pub min_daily_return_pct: Decimal,
    pub max_daily_return_pct: Decimal,
    pub cycle_days: u32,
    pub is_active: bool,
}

impl RobotPackage {
    pub fn new(
        name: impl Into<String>,
        min_investment: Decimal,
        max_investment: Decimal,
        min_daily_return_pct: Decimal,
        max_daily_return_pct: Decimal,
        cycle_days: u32,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            min_investment,
            max_investment,
            min_daily_return_pct,
            max_daily_return_pct,
            cycle_days,
            is_active: true,
        }
    }

    pub fn accepts(&self, amount: Decimal) -> bool {
        amount >= self.min_investment && amount <= self.max_investment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobotOrderStatus {
    Running,
    Completed,
    Redeemed,
}

string_enum!(RobotOrderStatus {
    Running => "Running",
    Completed => "Completed",
    Redeemed => "Redeemed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRevenue {
    pub date: i64,
    pub amount: Decimal,
    pub rate_pct: Decimal,
}

/// Principal locked into a package for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotOrder {
    pub id: String,
    pub user_id: String,
    pub package_id: String,
    pub investment: Decimal,
    pub asset: String,
    /// Return bounds copied from the package when hosted
    pub min_daily_return_pct: Decimal,
    pub max_daily_return_pct: Decimal,
    pub cycle_days: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub status: RobotOrderStatus,
    pub total_profit: Decimal,
    pub last_profit_distribution: Option<i64>,
    pub daily_revenue: Vec<DailyRevenue>,
    pub redemption_date: Option<i64>,
    pub redeemed_amount: Decimal,
}

/// What the robot monitor should do with an order right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotAction {
    Distribute,
    Complete,
    Idle,
}

impl RobotOrder {
    pub fn host(package: &RobotPackage, user_id: String, investment: Decimal, asset: String, now_ms: i64) -> Self {
        Self {
            id: new_id(),
            user_id,
            package_id: package.id.clone(),
            investment,
            asset,
            min_daily_return_pct: package.min_daily_return_pct,
            max_daily_return_pct: package.max_daily_return_pct,
            cycle_days: package.cycle_days,
            start_time: now_ms,
            end_time: now_ms + package.cycle_days as i64 * DAY_MS,
            status: RobotOrderStatus::Running,
            total_profit: Decimal::ZERO,
            last_profit_distribution: None,
            daily_revenue: Vec::new(),
            redemption_date: None,
            redeemed_amount: Decimal::ZERO,
        }
    }

    /// Distribution is due once per UTC day strictly after the last one (or
    /// the start) and only while the cycle is running.
    pub fn next_action(&self, now_ms: i64) -> RobotAction {
        if self.status != RobotOrderStatus::Running {
            return RobotAction::Idle;
        }
        let last = self.last_profit_distribution.unwrap_or(self.start_time);
        if now_ms < self.end_time {
            if utc_day(now_ms) > utc_day(last) {
                RobotAction::Distribute
            } else {
                RobotAction::Idle
            }
        } else {
            RobotAction::Complete
        }
    }

    pub fn daily_profit(&self, rate_pct: Decimal) -> Decimal {
        round_money(self.investment * rate_pct / dec!(100))
    }

    /// Record a distribution at `rate_pct`, returning the profit credited.
    pub fn record_distribution(&mut self, rate_pct: Decimal, now_ms: i64) -> Decimal {
        let profit = self.daily_profit(rate_pct);
        self.total_profit += profit;
        self.last_profit_distribution = Some(now_ms);
        self.daily_revenue.push(DailyRevenue {
            date: now_ms,
            amount: profit,
            rate_pct,
        });
        profit
    }

    /// Amount returned to available on redemption.
    pub fn redemption_amount(&self) -> Decimal {
        self.investment + self.total_profit
    }
}
