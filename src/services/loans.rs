//! Loan lifecycle and the daily accrual engine.
//!
//! Every loan mutation reads the loan and its owner's account, computes the
//! new state, and writes both back inside one `BEGIN IMMEDIATE` transaction.
//! The accrual engine wraps that unit in a bounded retry loop so a write
//! conflict with a concurrent repayment or withdrawal is retried rather than
//! lost.

use crate::error::{LedgerError, Result};
use crate::services::context::LedgerContext;
use crate::services::ledger::{append_log, apply_change, BalanceChange};
use crate::services::scheduler::{retry_transient, BatchReport, Monitor};
use crate::services::sqlite_store as db;
use crate::types::{
    now_ms, AccrualOutcome, Loan, LoanRepaymentRequest, LoanStatus, NotificationLevel,
    RepaymentRecorder, RepaymentRequestStatus, SiteSettings, TransactionEntry, TxCategory, TxKind,
};
use async_trait::async_trait;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Loan terms, in days, an admin may attach a rate to.
pub const LOAN_TERMS: [u32; 6] = [3, 7, 15, 30, 60, 90];

pub struct LoanService {
    ctx: LedgerContext,
}

impl LoanService {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Apply for a loan. The term must have a configured rate and the
    /// amount, together with principal already pending or outstanding, must
    /// fit the account's loan limit.
    pub fn submit_loan(&self, user_id: &str, amount: Decimal, term_days: u32) -> Result<Loan> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation("loan amount must be positive".to_string()));
        }
        let rate = self
            .ctx
            .settings()?
            .loan_rate(term_days)
            .ok_or_else(|| LedgerError::Validation(format!("no rate configured for {term_days} days")))?;

        let loan = self.ctx.store.with_transaction(|tx| {
            let account = db::require_account(tx, user_id)?;
            let committed: Decimal = db::list_user_loans(tx, user_id)?
                .iter()
                .filter(|l| matches!(l.status, LoanStatus::PendingApproval | LoanStatus::Approved))
                .map(|l| l.outstanding_principal)
                .sum();
            let limit = account.effective_loan_limit();
            if committed + amount > limit {
                return Err(LedgerError::Validation(format!(
                    "loan of {amount} exceeds limit {limit} ({committed} already committed)"
                )));
            }
            let loan = Loan::new(user_id.to_string(), amount, term_days, rate, now_ms());
            db::insert_loan(tx, &loan)?;
            Ok(loan)
        })?;

        info!("Loan {} submitted by {}: {} for {} days at {}%/day", loan.id, user_id, amount, term_days, rate);
        Ok(loan)
    }

    pub fn loans(&self, user_id: &str) -> Result<Vec<Loan>> {
        self.ctx.store.with_conn(|c| db::list_user_loans(c, user_id))
    }

    /// Admin status change.
    ///
    /// Approval disburses the principal and raises the loan aggregate in the
    /// same transaction. Final states never change. An approved loan can be
    /// manually defaulted, or marked repaid, which writes what is still owed
    /// off the loan aggregate without touching available.
    pub async fn set_loan_status(&self, loan_id: &str, status: LoanStatus, notes: Option<String>) -> Result<Loan> {
        let now = now_ms();
        let loan = self.ctx.store.with_transaction(|tx| {
            let mut loan = require_loan(tx, loan_id)?;
            let previous = loan.status;
            if previous.is_final() {
                return Err(LedgerError::InvalidState(format!("loan {loan_id} is already {previous}")));
            }

            match (previous, status) {
                (LoanStatus::PendingApproval, LoanStatus::Approved) => {
                    loan.approve(now);
                    apply_change(tx, &loan.user_id, BalanceChange::Credit(loan.loan_amount))?;
                    apply_change(tx, &loan.user_id, BalanceChange::LoanAggregate(loan.loan_amount))?;
                    append_log(
                        tx,
                        &TransactionEntry::new(
                            &loan.user_id,
                            loan.loan_amount,
                            TxKind::Credit,
                            TxCategory::Loan,
                            format!("Loan disbursement for {} days", loan.term_days),
                            Some(&loan.id),
                        ),
                    )?;
                }
                (LoanStatus::PendingApproval, LoanStatus::Rejected) => loan.status = status,
                (LoanStatus::Approved, LoanStatus::Defaulted) => {
                    loan.status = status;
                    loan.admin_notes = Some(format!("Status manually changed to {status}"));
                }
                (LoanStatus::Approved, LoanStatus::Repaid) => {
                    let written_off = loan.total_owed();
                    apply_change(tx, &loan.user_id, BalanceChange::LoanAggregate(-written_off))?;
                    loan.status = status;
                    loan.repaid_date = Some(now);
                    loan.admin_notes = Some(format!(
                        "Status manually changed to {status}, {written_off} written off"
                    ));
                }
                (from, to) => {
                    return Err(LedgerError::InvalidState(format!(
                        "loan {loan_id} cannot move from {from} to {to}"
                    )))
                }
            }

            if notes.is_some() {
                loan.admin_notes = notes;
            }
            if !db::update_loan(tx, &loan, previous)? {
                return Err(LedgerError::TransientConflict(format!("loan {loan_id} changed concurrently")));
            }
            Ok(loan)
        })?;

        info!("Loan {} is now {}", loan.id, loan.status);
        let message = match loan.status {
            LoanStatus::Approved => format!("Your loan of {} was approved and credited", loan.loan_amount),
            other => format!("Your loan of {} is now {}", loan.loan_amount, other),
        };
        self.ctx.notifier.notify(&loan.user_id, NotificationLevel::Info, message).await;
        Ok(loan)
    }

    /// Set the daily interest rate (percent) offered for a loan term.
    pub fn set_term_rate(&self, term_days: u32, daily_rate: Decimal) -> Result<SiteSettings> {
        if !LOAN_TERMS.contains(&term_days) {
            return Err(LedgerError::Validation(format!(
                "loan term must be one of {LOAN_TERMS:?} days"
            )));
        }
        if daily_rate < Decimal::ZERO {
            return Err(LedgerError::Validation("daily rate must not be negative".to_string()));
        }
        self.ctx.update_settings(|settings| {
            settings.loan_term_rates.insert(term_days, daily_rate);
            Ok(())
        })
    }

    /// Per-loan admin toggles. `None` leaves a flag unchanged.
    pub fn set_accrual_flags(
        &self,
        loan_id: &str,
        disable_interest: Option<bool>,
        disable_late_fees: Option<bool>,
    ) -> Result<Loan> {
        self.ctx.store.with_transaction(|tx| {
            let mut loan = require_loan(tx, loan_id)?;
            if let Some(flag) = disable_interest {
                loan.disable_interest_accrual = flag;
            }
            if let Some(flag) = disable_late_fees {
                loan.disable_late_fees_accrual = flag;
            }
            if !db::update_loan(tx, &loan, loan.status)? {
                return Err(LedgerError::TransientConflict(format!("loan {loan_id} changed concurrently")));
            }
            Ok(loan)
        })
    }

    /// File a repayment for admin approval. Funds move only on approval.
    pub fn request_repayment(&self, user_id: &str, loan_id: &str, amount: Decimal) -> Result<LoanRepaymentRequest> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation("repayment amount must be positive".to_string()));
        }
        let request = self.ctx.store.with_transaction(|tx| {
            let loan = require_loan(tx, loan_id)?;
            if loan.user_id != user_id {
                return Err(LedgerError::not_found("loan", loan_id));
            }
            if !matches!(loan.status, LoanStatus::Approved | LoanStatus::Defaulted) {
                return Err(LedgerError::InvalidState(format!("loan {loan_id} is {}", loan.status)));
            }
            let account = db::require_account(tx, user_id)?;
            if account.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available: account.available,
                });
            }
            let request = LoanRepaymentRequest::new(user_id.to_string(), loan_id.to_string(), amount, now_ms());
            db::insert_repayment_request(tx, &request)?;
            Ok(request)
        })?;
        info!("Repayment request {} for loan {}: {}", request.id, loan_id, amount);
        Ok(request)
    }

    /// Approve a pending repayment: debit what the loan still owes (up to
    /// the requested amount), walk it down the owed buckets, and lower the
    /// loan aggregate by the same amount.
    pub async fn approve_repayment(&self, request_id: &str, notes: Option<String>) -> Result<(LoanRepaymentRequest, Loan)> {
        let now = now_ms();
        let (request, loan, applied) = self.ctx.store.with_transaction(|tx| {
            let mut request = require_pending_request(tx, request_id)?;
            let mut loan = require_loan(tx, &request.loan_id)?;
            let previous = loan.status;
            if !matches!(previous, LoanStatus::Approved | LoanStatus::Defaulted) {
                return Err(LedgerError::InvalidState(format!("loan {} is {}", loan.id, previous)));
            }

            let allocation = loan.apply_payment(request.amount, RepaymentRecorder::Admin, now);
            let applied = allocation.applied();
            if applied <= Decimal::ZERO {
                return Err(LedgerError::InvalidState(format!("loan {} has nothing owed", loan.id)));
            }

            apply_change(tx, &loan.user_id, BalanceChange::Debit(applied))?;
            apply_change(tx, &loan.user_id, BalanceChange::LoanAggregate(-applied))?;
            append_log(
                tx,
                &TransactionEntry::new(
                    &loan.user_id,
                    applied,
                    TxKind::Debit,
                    TxCategory::Repayment,
                    format!(
                        "Loan repayment: fees {} overdue {} interest {} principal {}",
                        allocation.late_fees, allocation.overdue_interest, allocation.interest, allocation.principal
                    ),
                    Some(&loan.id),
                ),
            )?;
            if !db::update_loan(tx, &loan, previous)? {
                return Err(LedgerError::TransientConflict(format!("loan {} changed concurrently", loan.id)));
            }
            if !db::decide_repayment_request(tx, request_id, RepaymentRequestStatus::Approved, now, notes.as_deref())? {
                return Err(LedgerError::InvalidState(format!("repayment {request_id} already decided")));
            }
            request.status = RepaymentRequestStatus::Approved;
            request.decided_at = Some(now);
            request.admin_notes = notes;
            Ok((request, loan, applied))
        })?;

        info!("Repayment {} approved: {} applied to loan {} ({})", request.id, applied, loan.id, loan.status);
        let message = if loan.status == LoanStatus::Repaid {
            format!("Your loan of {} is fully repaid", loan.loan_amount)
        } else {
            format!("Your repayment of {} was applied", applied)
        };
        self.ctx.notifier.notify(&loan.user_id, NotificationLevel::Info, message).await;
        Ok((request, loan))
    }

    pub async fn reject_repayment(&self, request_id: &str, notes: Option<String>) -> Result<LoanRepaymentRequest> {
        let now = now_ms();
        let request = self.ctx.store.with_transaction(|tx| {
            let mut request = require_pending_request(tx, request_id)?;
            if !db::decide_repayment_request(tx, request_id, RepaymentRequestStatus::Rejected, now, notes.as_deref())? {
                return Err(LedgerError::InvalidState(format!("repayment {request_id} already decided")));
            }
            request.status = RepaymentRequestStatus::Rejected;
            request.decided_at = Some(now);
            request.admin_notes = notes;
            Ok(request)
        })?;
        info!("Repayment {} rejected", request.id);
        self.ctx
            .notifier
            .notify(
                &request.user_id,
                NotificationLevel::Warning,
                format!("Your repayment of {} was rejected", request.amount),
            )
            .await;
        Ok(request)
    }
}

/// Daily interest, overdue charges and default detection for every
/// Approved or Defaulted loan.
pub struct LoanAccrualEngine {
    ctx: LedgerContext,
    max_attempts: u32,
    processing_delay: Duration,
}

impl LoanAccrualEngine {
    pub fn new(ctx: LedgerContext, max_attempts: u32, processing_delay: Duration) -> Self {
        Self {
            ctx,
            max_attempts: max_attempts.max(1),
            processing_delay,
        }
    }

    /// One isolated accrual attempt for one loan. Returns what changed, or
    /// `None` when nothing was due.
    pub fn accrue_loan(&self, loan_id: &str, now: i64) -> Result<Option<(Loan, AccrualOutcome)>> {
        self.ctx.store.with_transaction(|tx| {
            let mut loan = require_loan(tx, loan_id)?;
            let previous = loan.status;
            if !matches!(previous, LoanStatus::Approved | LoanStatus::Defaulted) {
                return Ok(None);
            }
            let account = db::require_account(tx, &loan.user_id)?;
            let outcome = loan.accrue(now, account.available, account.loan);
            if !outcome.changed() {
                return Ok(None);
            }
            let delta = outcome.loan_delta();
            if !delta.is_zero() {
                apply_change(tx, &loan.user_id, BalanceChange::LoanAggregate(delta))?;
            }
            if !db::update_loan(tx, &loan, previous)? {
                return Err(LedgerError::TransientConflict(format!("loan {loan_id} changed concurrently")));
            }
            Ok(Some((loan, outcome)))
        })
    }

    async fn process_loan(&self, loan_id: &str, now: i64) -> Result<Option<(Loan, AccrualOutcome)>> {
        let what = format!("accrual for loan {loan_id}");
        retry_transient(&what, self.max_attempts, RETRY_BASE_DELAY, || async move {
            self.accrue_loan(loan_id, now)
        })
        .await
    }
}

#[async_trait]
impl Monitor for LoanAccrualEngine {
    fn name(&self) -> &'static str {
        "loan-accrual"
    }

    async fn process_batch_at(&self, now: i64) -> Result<BatchReport> {
        let loans = self.ctx.store.with_conn(|c| {
            db::list_loans_by_status(c, &[LoanStatus::Approved, LoanStatus::Defaulted])
        })?;

        let mut report = BatchReport::default();
        for (i, loan) in loans.iter().enumerate() {
            if i > 0 && !self.processing_delay.is_zero() {
                tokio::time::sleep(self.processing_delay).await;
            }
            report.processed += 1;
            match self.process_loan(&loan.id, now).await {
                Ok(Some((loan, outcome))) => {
                    report.settled += 1;
                    debug!(
                        "Loan {} accrued interest {} overdue {} fee {}",
                        loan.id, outcome.interest, outcome.overdue_interest, outcome.late_fee
                    );
                    if outcome.defaulted {
                        warn!("Loan {} for {} defaulted", loan.id, loan.user_id);
                        self.ctx
                            .notifier
                            .notify(
                                &loan.user_id,
                                NotificationLevel::Critical,
                                format!("Your loan of {} is overdue and has defaulted", loan.loan_amount),
                            )
                            .await;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) if e.is_transient() => {
                    report.failed += 1;
                    error!("Loan {} accrual gave up after {} attempts: {}", loan.id, self.max_attempts, e);
                    self.ctx
                        .notifier
                        .alert(format!(
                            "Loan {} accrual failed after {} attempts and will be retried next run: {}",
                            loan.id, self.max_attempts, e
                        ))
                        .await;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Loan {} accrual failed: {}", loan.id, e);
                }
            }
        }
        Ok(report)
    }
}

fn require_loan(conn: &Connection, loan_id: &str) -> Result<Loan> {
    db::get_loan(conn, loan_id)?.ok_or_else(|| LedgerError::not_found("loan", loan_id))
}

fn require_pending_request(conn: &Connection, request_id: &str) -> Result<LoanRepaymentRequest> {
    let request = db::get_repayment_request(conn, request_id)?
        .ok_or_else(|| LedgerError::not_found("repayment request", request_id))?;
    if request.status != RepaymentRequestStatus::Pending {
        return Err(LedgerError::InvalidState(format!(
            "repayment {request_id} is already {}",
            request.status
        )));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{context_with, fund};
    use rust_decimal_macros::dec;

    const DAY: i64 = 86_400_000;

    fn setup(available: Decimal) -> (LedgerContext, LoanService) {
        let (ctx, _quotes) = context_with(&[]);
        fund(&ctx, "u", available);
        ctx.ledger.set_limits("u", Some(dec!(5000)), None).unwrap();
        let service = LoanService::new(ctx.clone());
        service.set_term_rate(7, dec!(1)).unwrap();
        (ctx, service)
    }

    #[tokio::test]
    async fn test_approval_disburses_and_raises_aggregate() {
        let (ctx, service) = setup(Decimal::ZERO);
        let loan = service.submit_loan("u", dec!(1000), 7).unwrap();
        assert_eq!(loan.status, LoanStatus::PendingApproval);
        assert_eq!(loan.daily_interest_rate, dec!(1));

        let loan = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        assert!(loan.due_date.is_some());

        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.available, dec!(1000));
        assert_eq!(acc.loan, dec!(1000));

        let err = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_term_rate_validation() {
        let (ctx, service) = setup(Decimal::ZERO);
        assert!(matches!(
            service.set_term_rate(10, dec!(1)).unwrap_err(),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            service.set_term_rate(30, dec!(-0.5)).unwrap_err(),
            LedgerError::Validation(_)
        ));

        let settings = service.set_term_rate(30, dec!(0.5)).unwrap();
        assert_eq!(settings.loan_rate(30), Some(dec!(0.5)));
        assert_eq!(settings.loan_rate(7), Some(dec!(1)));
        assert_eq!(ctx.settings().unwrap(), settings);
        assert_eq!(service.submit_loan("u", dec!(100), 30).unwrap().daily_interest_rate, dec!(0.5));
    }

    #[tokio::test]
    async fn test_manual_overrides() {
        let (ctx, service) = setup(Decimal::ZERO);
        let pending = service.submit_loan("u", dec!(500), 7).unwrap();
        assert!(matches!(
            service
                .set_loan_status(&pending.id, LoanStatus::Defaulted, None)
                .await
                .unwrap_err(),
            LedgerError::InvalidState(_)
        ));

        let loan = service.submit_loan("u", dec!(1000), 7).unwrap();
        let loan = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        let engine = LoanAccrualEngine::new(ctx.clone(), 3, Duration::ZERO);
        engine
            .process_batch_at(loan.approval_date.unwrap() + DAY)
            .await
            .unwrap();
        assert_eq!(ctx.ledger.account("u").unwrap().loan, dec!(1010));

        let repaid = service
            .set_loan_status(&loan.id, LoanStatus::Repaid, None)
            .await
            .unwrap();
        assert_eq!(repaid.status, LoanStatus::Repaid);
        assert!(repaid.repaid_date.is_some());
        assert!(repaid.admin_notes.unwrap().contains("1010"));

        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.loan, Decimal::ZERO);
        assert_eq!(acc.available, dec!(1000));

        assert!(matches!(
            service
                .set_loan_status(&loan.id, LoanStatus::Approved, None)
                .await
                .unwrap_err(),
            LedgerError::InvalidState(_)
        ));
    }

    #[test]
    fn test_limit_and_rate_checks() {
        let (_ctx, service) = setup(Decimal::ZERO);
        assert!(matches!(
            service.submit_loan("u", dec!(10), 30).unwrap_err(),
            LedgerError::Validation(_)
        ));
        service.submit_loan("u", dec!(4000), 7).unwrap();
        assert!(matches!(
            service.submit_loan("u", dec!(1001), 7).unwrap_err(),
            LedgerError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_same_day_accrual_is_noop() {
        let (ctx, service) = setup(Decimal::ZERO);
        let loan = service.submit_loan("u", dec!(1000), 7).unwrap();
        let loan = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        let engine = LoanAccrualEngine::new(ctx.clone(), 3, Duration::ZERO);
        let approved_at = loan.approval_date.unwrap();

        let first = engine.process_batch_at(approved_at + DAY).await.unwrap();
        assert_eq!(first.settled, 1);
        let second = engine.process_batch_at(approved_at + DAY + 1).await.unwrap();
        assert_eq!(second.settled, 0);
        assert_eq!(second.skipped, 1);

        let loan = service.loans("u").unwrap().remove(0);
        assert_eq!(loan.accrued_interest, dec!(10));
        assert_eq!(ctx.ledger.account("u").unwrap().loan, dec!(1010));
    }

    #[tokio::test]
    async fn test_repayment_walks_buckets_and_repays() {
        let (ctx, service) = setup(Decimal::ZERO);
        let loan = service.submit_loan("u", dec!(1000), 7).unwrap();
        let loan = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        let engine = LoanAccrualEngine::new(ctx.clone(), 3, Duration::ZERO);
        engine
            .process_batch_at(loan.approval_date.unwrap() + DAY)
            .await
            .unwrap();
        ctx.ledger
            .credit("u", dec!(100), TxCategory::Deposit, "top up", None)
            .unwrap();

        let partial = service.request_repayment("u", &loan.id, dec!(500)).unwrap();
        let (_, loan) = service.approve_repayment(&partial.id, None).await.unwrap();
        assert_eq!(loan.accrued_interest, Decimal::ZERO);
        assert_eq!(loan.outstanding_principal, dec!(510));

        let rest = service.request_repayment("u", &loan.id, dec!(600)).unwrap();
        let (request, loan) = service
            .approve_repayment(&rest.id, Some("settled".to_string()))
            .await
            .unwrap();
        assert_eq!(request.status, RepaymentRequestStatus::Approved);
        assert_eq!(loan.status, LoanStatus::Repaid);
        assert_eq!(loan.amount_repaid, dec!(1010));
        assert_eq!(loan.repayment_history.len(), 2);

        // Only what was owed is taken.
        let acc = ctx.ledger.account("u").unwrap();
        assert_eq!(acc.available, dec!(90));
        assert_eq!(acc.loan, Decimal::ZERO);

        assert!(matches!(
            service.approve_repayment(&rest.id, None).await.unwrap_err(),
            LedgerError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_reject_repayment_moves_nothing() {
        let (ctx, service) = setup(dec!(100));
        let loan = service.submit_loan("u", dec!(50), 7).unwrap();
        service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        let request = service.request_repayment("u", &loan.id, dec!(20)).unwrap();
        let rejected = service.reject_repayment(&request.id, None).await.unwrap();
        assert_eq!(rejected.status, RepaymentRequestStatus::Rejected);
        assert_eq!(ctx.ledger.account("u").unwrap().available, dec!(150));
    }

    #[tokio::test]
    async fn test_disabled_interest_skips_accrual() {
        let (ctx, service) = setup(Decimal::ZERO);
        let loan = service.submit_loan("u", dec!(100), 7).unwrap();
        let loan = service
            .set_loan_status(&loan.id, LoanStatus::Approved, None)
            .await
            .unwrap();
        service.set_accrual_flags(&loan.id, Some(true), None).unwrap();

        let engine = LoanAccrualEngine::new(ctx.clone(), 3, Duration::ZERO);
        let report = engine
            .process_batch_at(loan.approval_date.unwrap() + DAY)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(ctx.ledger.account("u").unwrap().loan, dec!(100));
    }
}
