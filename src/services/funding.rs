//! Admin-settled deposits and withdrawals.

use crate::error::{LedgerError, Result};
use crate::services::context::LedgerContext;
use crate::services::ledger::{append_log, apply_change, BalanceChange};
use crate::services::sqlite_store as db;
use crate::types::{
    now_ms, round_money, FundRequest, FundStatus, NotificationLevel, TransactionEntry, TxCategory,
    TxKind, WithdrawalRequest, WithdrawalStatus,
};
use rust_decimal::Decimal;
use tracing::info;

pub struct FundingService {
    ctx: LedgerContext,
}

impl FundingService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    pub fn submit_fund_request(
        &self,
        user_id: &str,
        amount: Decimal,
        currency: &str,
        chain_name: &str,
        payment_proof: &str,
    ) -> Result<FundRequest> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation("deposit amount must be positive".to_string()));
        }
        let request = FundRequest::new(
            user_id.to_string(),
            amount,
            currency.trim().to_uppercase(),
            chain_name.to_string(),
            payment_proof.to_string(),
            now_ms(),
        );
        self.ctx.store.with_transaction(|tx| {
            db::require_account(tx, user_id)?;
            db::insert_fund_request(tx, &request)
        })?;
        info!("Fund request {} from {}: {} {}", request.id, user_id, amount, request.currency);
        Ok(request)
    }

    /// Change a deposit's status. The balance is credited only on the
    /// transition into `completed`, and a completed deposit is final.
    pub async fn set_fund_status(&self, request_id: &str, status: FundStatus) -> Result<FundRequest> {
        let now = now_ms();
        let request = self.ctx.store.with_transaction(|tx| {
            let mut request = db::get_fund_request(tx, request_id)?
                .ok_or_else(|| LedgerError::not_found("fund request", request_id))?;
            let previous = request.status;
            if previous == FundStatus::Completed {
                return Err(LedgerError::InvalidState(format!("fund request {request_id} is already completed")));
            }
            if previous == status {
                return Ok(request);
            }
            if !db::set_fund_status(tx, request_id, status, previous, now)? {
                return Err(LedgerError::InvalidState(format!("fund request {request_id} changed concurrently")));
            }
            if status == FundStatus::Completed {
                apply_change(tx, &request.user_id, BalanceChange::Credit(request.amount))?;
                append_log(
                    tx,
                    &TransactionEntry::new(
                        &request.user_id,
                        request.amount,
                        TxKind::Credit,
                        TxCategory::Deposit,
                        format!("Deposit via {}", request.chain_name),
                        Some(&request.id),
                    ),
                )?;
            }
            request.status = status;
            request.updated_at = now;
            Ok(request)
        })?;

        info!("Fund request {} is now {}", request.id, request.status);
        if request.status == FundStatus::Completed {
            self.ctx
                .notifier
                .notify(
                    &request.user_id,
                    NotificationLevel::Info,
                    format!("Your deposit of {} {} was credited", request.amount, request.currency),
                )
                .await;
        }
        Ok(request)
    }

    /// File a withdrawal for admin review. The request amount must be covered
    /// by the available balance and no loan may be outstanding; the USD value
    /// is checked again when the withdrawal is completed.
    pub fn submit_withdrawal(
        &self,
        user_id: &str,
        amount: Decimal,
        currency: &str,
        chain_name: &str,
        to_address: &str,
    ) -> Result<WithdrawalRequest> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation("withdrawal amount must be positive".to_string()));
        }
        if to_address.trim().is_empty() {
            return Err(LedgerError::Validation("destination address is required".to_string()));
        }
        let request = WithdrawalRequest::new(
            user_id.to_string(),
            amount,
            currency.trim().to_uppercase(),
            chain_name.to_string(),
            to_address.trim().to_string(),
            now_ms(),
        );
        self.ctx.store.with_transaction(|tx| {
            let account = db::require_account(tx, user_id)?;
            if account.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available: account.available,
                });
            }
            if account.loan > Decimal::ZERO {
                return Err(LedgerError::Validation(
                    "settle the outstanding loan balance before withdrawing".to_string(),
                ));
            }
            db::insert_withdrawal_request(tx, &request)
        })?;
        info!("Withdrawal request {} from {}: {} {}", request.id, user_id, amount, request.currency);
        Ok(request)
    }

    /// Change a withdrawal's status. Completion converts the amount to USD,
    /// debits available, and can happen only once.
    pub async fn set_withdrawal_status(&self, request_id: &str, status: WithdrawalStatus) -> Result<WithdrawalRequest> {
        let current = self
            .ctx
            .store
            .with_conn(|c| db::get_withdrawal_request(c, request_id))?
            .ok_or_else(|| LedgerError::not_found("withdrawal request", request_id))?;
        if current.status == WithdrawalStatus::Completed || current.is_approved_once {
            return Err(LedgerError::InvalidState(format!("withdrawal {request_id} has already been approved")));
        }

        // Priced before the write transaction; the transaction re-checks state.
        let usd_rate = match status {
            WithdrawalStatus::Completed => Some(self.ctx.prices.usd_rate(&current.currency).await?),
            _ => None,
        };

        let now = now_ms();
        let request = self.ctx.store.with_transaction(|tx| {
            let mut request = db::get_withdrawal_request(tx, request_id)?
                .ok_or_else(|| LedgerError::not_found("withdrawal request", request_id))?;
            let previous = request.status;
            if previous != current.status || request.is_approved_once {
                return Err(LedgerError::InvalidState(format!("withdrawal {request_id} changed concurrently")));
            }

            if let Some(rate) = usd_rate {
                let usd = round_money(request.amount * rate);
                apply_change(tx, &request.user_id, BalanceChange::Debit(usd))?;
                append_log(
                    tx,
                    &TransactionEntry::new(
                        &request.user_id,
                        usd,
                        TxKind::Debit,
                        TxCategory::Withdrawal,
                        format!("Withdrawal of {} {} to {}", request.amount, request.currency, request.to_address),
                        Some(&request.id),
                    ),
                )?;
                request.amount_in_usd = Some(usd);
                request.is_approved_once = true;
            }
            request.status = status;
            request.updated_at = now;
            if !db::update_withdrawal(tx, &request, previous)? {
                return Err(LedgerError::InvalidState(format!("withdrawal {request_id} changed concurrently")));
            }
            Ok(request)
        })?;

        info!("Withdrawal {} is now {}", request.id, request.status);
        let message = match request.status {
            WithdrawalStatus::Completed => "Your withdrawal request has been approved".to_string(),
            WithdrawalStatus::Rejected => "Your withdrawal request was rejected".to_string(),
            WithdrawalStatus::Pending => "Your withdrawal request is pending review".to_string(),
        };
        self.ctx
            .notifier
            .notify(&request.user_id, NotificationLevel::Info, message)
            .await;
        Ok(request)
    }
}
