//! Deposit and withdrawal requests settled by an admin.

use super::new_id;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundStatus {
    Pending,
    Completed,
    Fraud,
}

string_enum!(FundStatus {
    Pending => "pending",
    Completed => "completed",
    Fraud => "fraud",
});

/// A user-submitted deposit awaiting admin confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundRequest {
    pub id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain_name: String,
    /// Reference to the uploaded payment proof
    pub payment_proof: String,
    pub status: FundStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FundRequest {
    pub fn new(
        user_id: String,
        amount: Decimal,
        currency: String,
        chain_name: String,
        payment_proof: String,
        now_ms: i64,
    ) -> Self {
        Self {
            id: new_id(),
            user_id,
            amount,
            currency,
            chain_name,
            payment_proof,
            status: FundStatus::Pending,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

string_enum!(WithdrawalStatus {
    Pending => "pending",
    Completed => "completed",
    Rejected => "rejected",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub id: String,
    pub user_id: String,
    /// Amount in `currency`
    pub amount: Decimal,
    pub currency: String,
    pub chain_name: String,
    pub to_address: String,
    /// USD value debited at approval
    pub amount_in_usd: Option<Decimal>,
    pub status: WithdrawalStatus,
    pub is_approved_once: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WithdrawalRequest {
    pub fn new(
        user_id: String,
        amount: Decimal,
        currency: String,
        chain_name: String,
        to_address: String,
        now_ms: i64,
    ) -> Self {
        Self {
            id: new_id(),
            user_id,
            amount,
            currency,
            chain_name,
            to_address,
            amount_in_usd: None,
            status: WithdrawalStatus::Pending,
            is_approved_once: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}
