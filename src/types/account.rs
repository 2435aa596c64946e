//! Account balances and the supplementary transaction log.

use super::{new_id, now_ms, round_money};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Share of available balance granted as loan limit when none is configured.
pub const DEFAULT_LOAN_LIMIT_SHARE: Decimal = dec!(0.20);

/// Default number of concurrently running AI-robot orders.
pub const DEFAULT_ROBOT_LIMIT: u32 = 1;

/// A user's balances. Never deleted, only updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    /// Spendable funds
    pub available: Decimal,
    /// Funds reserved against open trades, positions and robot orders
    pub locked: Decimal,
    /// Display aggregate of loan principal, interest and fees
    pub loan: Decimal,
    /// Admin-set loan limit (zero means derive from available balance)
    pub loan_limit: Decimal,
    pub robot_limit: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn new(user_id: String) -> Self {
        let now = now_ms();
        Self {
            user_id,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            loan: Decimal::ZERO,
            loan_limit: Decimal::ZERO,
            robot_limit: DEFAULT_ROBOT_LIMIT,
            created_at: now,
            updated_at: now,
        }
    }

    /// Available plus locked.
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    pub fn effective_loan_limit(&self) -> Decimal {
        if self.loan_limit > Decimal::ZERO {
            self.loan_limit
        } else {
            round_money(self.available * DEFAULT_LOAN_LIMIT_SHARE)
        }
    }
}

/// Direction of a completed balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Credit,
    Debit,
}

string_enum!(TxKind {
    Credit => "credit",
    Debit => "debit",
});

/// What produced a transaction log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCategory {
    Loan,
    Repayment,
    Deposit,
    Withdrawal,
    Trading,
    Contract,
    AiRobotPurchase,
    AiRobotProfit,
    AiRobotRedemption,
}

string_enum!(TxCategory {
    Loan => "loan",
    Repayment => "repayment",
    Deposit => "deposit",
    Withdrawal => "withdrawal",
    Trading => "trading",
    Contract => "contract",
    AiRobotPurchase => "ai_robot_purchase",
    AiRobotProfit => "ai_robot_profit",
    AiRobotRedemption => "ai_robot_redemption",
});

/// Append-only record of a completed credit or debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub id: String,
    pub user_id: String,
    /// Always positive; direction is carried by `kind`
    pub amount: Decimal,
    pub kind: TxKind,
    pub category: TxCategory,
    pub description: String,
    /// Originating trade, position, loan, order or request
    pub reference_id: Option<String>,
    pub created_at: i64,
}

impl TransactionEntry {
    pub fn new(
        user_id: &str,
        amount: Decimal,
        kind: TxKind,
        category: TxCategory,
        description: impl Into<String>,
        reference_id: Option<&str>,
    ) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            amount: amount.abs(),
            kind,
            category,
            description: description.into(),
            reference_id: reference_id.map(str::to_string),
            created_at: now_ms(),
        }
    }

    /// Credit for a positive delta, debit for a negative one, `None` for zero.
    pub fn for_delta(
        user_id: &str,
        delta: Decimal,
        category: TxCategory,
        description: impl Into<String>,
        reference_id: Option<&str>,
    ) -> Option<Self> {
        if delta.is_zero() {
            return None;
        }
        let kind = if delta > Decimal::ZERO {
            TxKind::Credit
        } else {
            TxKind::Debit
        };
        Some(Self::new(user_id, delta, kind, category, description, reference_id))
    }
}
