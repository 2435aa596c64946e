//! Loans, accrual and repayment requests.

use super::{new_id, round_money, utc_day};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 86_400_000;

/// Overdue interest charged per day against outstanding principal, in percent.
pub const OVERDUE_INTEREST_PCT: Decimal = dec!(0.02);

/// Late fee charged per overdue day against the original loan amount, in percent.
pub const LATE_FEE_PCT: Decimal = dec!(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    PendingApproval,
    Approved,
    Repaid,
    Defaulted,
    Rejected,
}

string_enum!(LoanStatus {
    PendingApproval => "pending_approval",
    Approved => "approved",
    Repaid => "repaid",
    Defaulted => "defaulted",
    Rejected => "rejected",
});

impl LoanStatus {
    /// Final states accept no further status change.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            LoanStatus::Repaid | LoanStatus::Defaulted | LoanStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepaymentKind {
    Partial,
    Full,
}

string_enum!(RepaymentKind {
    Partial => "partial",
    Full => "full",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepaymentRecorder {
    User,
    Admin,
    Monitor,
}

string_enum!(RepaymentRecorder {
    User => "user",
    Admin => "admin",
    Monitor => "monitor",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepaymentRecord {
    pub amount: Decimal,
    pub date: i64,
    pub kind: RepaymentKind,
    pub recorded_by: RepaymentRecorder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: String,
    pub user_id: String,
    pub loan_amount: Decimal,
    pub outstanding_principal: Decimal,
    pub term_days: u32,
    /// Percent per day, from the term table at creation
    pub daily_interest_rate: Decimal,
    pub accrued_interest: Decimal,
    pub overdue_interest_accrued: Decimal,
    pub late_payment_fees_accrued: Decimal,
    pub amount_repaid: Decimal,
    pub status: LoanStatus,
    pub loan_date: i64,
    pub approval_date: Option<i64>,
    pub due_date: Option<i64>,
    pub repaid_date: Option<i64>,
    pub disable_interest_accrual: bool,
    pub disable_late_fees_accrual: bool,
    pub last_interest_accrual_date: Option<i64>,
    pub last_overdue_charge_date: Option<i64>,
    pub admin_notes: Option<String>,
    pub repayment_history: Vec<RepaymentRecord>,
}

/// What one accrual pass changed. All zero when nothing was due.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccrualOutcome {
    pub interest: Decimal,
    pub overdue_interest: Decimal,
    pub late_fee: Decimal,
    pub defaulted: bool,
}

impl AccrualOutcome {
    /// Amount mirrored into the account's loan aggregate.
    pub fn loan_delta(&self) -> Decimal {
        self.interest + self.overdue_interest + self.late_fee
    }

    pub fn changed(&self) -> bool {
        !self.loan_delta().is_zero() || self.defaulted
    }
}

/// How a payment was split across the owed buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaymentAllocation {
    pub late_fees: Decimal,
    pub overdue_interest: Decimal,
    pub interest: Decimal,
    pub principal: Decimal,
}

impl PaymentAllocation {
    pub fn applied(&self) -> Decimal {
        self.late_fees + self.overdue_interest + self.interest + self.principal
    }
}

/// Was the watermark set on an earlier UTC day than `now`?
fn due_today(watermark: Option<i64>, now_ms: i64) -> bool {
    match watermark {
        Some(ts) => utc_day(ts) < utc_day(now_ms),
        None => true,
    }
}

/// Take as much of `remaining` as `bucket` holds.
fn take(bucket: &mut Decimal, remaining: &mut Decimal) -> Decimal {
    let paid = (*remaining).min(*bucket).max(Decimal::ZERO);
    *bucket -= paid;
    *remaining -= paid;
    paid
}

impl Loan {
    pub fn new(user_id: String, amount: Decimal, term_days: u32, daily_interest_rate: Decimal, now_ms: i64) -> Self {
        Self {
            id: new_id(),
            user_id,
            loan_amount: amount,
            outstanding_principal: amount,
            term_days,
            daily_interest_rate,
            accrued_interest: Decimal::ZERO,
            overdue_interest_accrued: Decimal::ZERO,
            late_payment_fees_accrued: Decimal::ZERO,
            amount_repaid: Decimal::ZERO,
            status: LoanStatus::PendingApproval,
            loan_date: now_ms,
            approval_date: None,
            due_date: None,
            repaid_date: None,
            disable_interest_accrual: false,
            disable_late_fees_accrual: false,
            last_interest_accrual_date: None,
            last_overdue_charge_date: None,
            admin_notes: None,
            repayment_history: Vec::new(),
        }
    }

    /// Mark approved and start both accrual watermarks at approval time.
    pub fn approve(&mut self, now_ms: i64) {
        self.status = LoanStatus::Approved;
        self.approval_date = Some(now_ms);
        self.due_date = Some(now_ms + self.term_days as i64 * DAY_MS);
        self.last_interest_accrual_date = Some(now_ms);
        self.last_overdue_charge_date = Some(now_ms);
    }

    pub fn is_overdue(&self, now_ms: i64) -> bool {
        self.due_date.map(|due| now_ms > due).unwrap_or(false)
    }

    pub fn total_owed(&self) -> Decimal {
        self.outstanding_principal
            + self.accrued_interest
            + self.overdue_interest_accrued
            + self.late_payment_fees_accrued
    }

    pub fn is_fully_repaid(&self) -> bool {
        self.total_owed() <= Decimal::ZERO
    }

    /// Apply one day's interest, overdue charges and default detection.
    ///
    /// Each charge is gated on its own watermark so calling this again on the
    /// same UTC day changes nothing. `available` and `loan_aggregate` are the
    /// account's balances before this pass.
    pub fn accrue(&mut self, now_ms: i64, available: Decimal, loan_aggregate: Decimal) -> AccrualOutcome {
        let mut outcome = AccrualOutcome::default();

        if !self.disable_interest_accrual
            && self.status == LoanStatus::Approved
            && due_today(self.last_interest_accrual_date, now_ms)
        {
            let interest = round_money(self.outstanding_principal * self.daily_interest_rate / dec!(100));
            if interest > Decimal::ZERO {
                self.accrued_interest += interest;
                self.last_interest_accrual_date = Some(now_ms);
                outcome.interest = interest;
            }
        }

        if !self.is_overdue(now_ms) {
            return outcome;
        }

        if !self.disable_late_fees_accrual && due_today(self.last_overdue_charge_date, now_ms) {
            let overdue = round_money(self.outstanding_principal * OVERDUE_INTEREST_PCT / dec!(100));
            let fee = round_money(self.loan_amount * LATE_FEE_PCT / dec!(100));
            if overdue > Decimal::ZERO || fee > Decimal::ZERO {
                self.overdue_interest_accrued += overdue;
                self.late_payment_fees_accrued += fee;
                self.last_overdue_charge_date = Some(now_ms);
                outcome.overdue_interest = overdue;
                outcome.late_fee = fee;
            }
        }

        if self.status == LoanStatus::Approved && available < loan_aggregate + outcome.loan_delta() {
            self.status = LoanStatus::Defaulted;
            outcome.defaulted = true;
        }

        outcome
    }

    /// Walk a payment down late fees, overdue interest, accrued interest and
    /// finally principal. Anything beyond the total owed is not taken.
    pub fn apply_payment(&mut self, amount: Decimal, recorded_by: RepaymentRecorder, now_ms: i64) -> PaymentAllocation {
        let mut remaining = amount;
        let allocation = PaymentAllocation {
            late_fees: take(&mut self.late_payment_fees_accrued, &mut remaining),
            overdue_interest: take(&mut self.overdue_interest_accrued, &mut remaining),
            interest: take(&mut self.accrued_interest, &mut remaining),
            principal: take(&mut self.outstanding_principal, &mut remaining),
        };

        let applied = allocation.applied();
        self.amount_repaid += applied;

        let kind = if self.is_fully_repaid() {
            self.status = LoanStatus::Repaid;
            self.repaid_date = Some(now_ms);
            RepaymentKind::Full
        } else {
            RepaymentKind::Partial
        };
        self.repayment_history.push(RepaymentRecord {
            amount: applied,
            date: now_ms,
            kind,
            recorded_by,
        });

        allocation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepaymentRequestStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(RepaymentRequestStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// A user's proposal to pay down a loan, settled by an admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanRepaymentRequest {
    pub id: String,
    pub user_id: String,
    pub loan_id: String,
    pub amount: Decimal,
    pub status: RepaymentRequestStatus,
    pub request_date: i64,
    pub decided_at: Option<i64>,
    pub admin_notes: Option<String>,
}

impl LoanRepaymentRequest {
    pub fn new(user_id: String, loan_id: String, amount: Decimal, now_ms: i64) -> Self {
        Self {
            id: new_id(),
            user_id,
            loan_id,
            amount,
            status: RepaymentRequestStatus::Pending,
            request_date: now_ms,
            decided_at: None,
            admin_notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_709_251_200_000; // 2024-03-01T00:00:00Z

    fn approved_loan() -> Loan {
        let mut loan = Loan::new("user-1".to_string(), dec!(1000), 7, dec!(1), T0);
        loan.approve(T0 + 3_600_000);
        loan
    }

    #[test]
    fn test_approve_sets_due_date_and_watermarks() {
        let loan = approved_loan();
        assert_eq!(loan.status, LoanStatus::Approved);
        assert_eq!(loan.due_date, Some(T0 + 3_600_000 + 7 * DAY_MS));
        assert_eq!(loan.last_interest_accrual_date, loan.approval_date);
        assert_eq!(loan.last_overdue_charge_date, loan.approval_date);
    }

    #[test]
    fn test_no_accrual_on_approval_day() {
        let mut loan = approved_loan();
        let outcome = loan.accrue(T0 + 20 * 3_600_000, dec!(5000), dec!(1000));
        assert_eq!(outcome, AccrualOutcome::default());
    }

    #[test]
    fn test_interest_accrues_once_per_day() {
        let mut loan = approved_loan();
        let next_day = T0 + DAY_MS + 60_000;

        let first = loan.accrue(next_day, dec!(5000), dec!(1000));
        assert_eq!(first.interest, dec!(10));
        assert_eq!(loan.accrued_interest, dec!(10));

        let second = loan.accrue(next_day + 3_600_000, dec!(5000), dec!(1010));
        assert!(!second.changed());
        assert_eq!(loan.accrued_interest, dec!(10));
    }

    #[test]
    fn test_disabled_interest() {
        let mut loan = approved_loan();
        loan.disable_interest_accrual = true;
        let outcome = loan.accrue(T0 + DAY_MS * 2, dec!(5000), dec!(1000));
        assert_eq!(outcome.interest, Decimal::ZERO);
    }

    #[test]
    fn test_overdue_charges_and_default() {
        let mut loan = approved_loan();
        let overdue_day = T0 + 10 * DAY_MS;

        let outcome = loan.accrue(overdue_day, dec!(100), dec!(1000));
        assert_eq!(outcome.interest, dec!(10));
        assert_eq!(outcome.overdue_interest, dec!(0.2));
        assert_eq!(outcome.late_fee, dec!(20));
        assert!(outcome.defaulted);
        assert_eq!(loan.status, LoanStatus::Defaulted);

        // Defaulted loans keep collecting overdue charges but no regular interest
        let next = loan.accrue(overdue_day + DAY_MS, dec!(100), dec!(1030.2));
        assert_eq!(next.interest, Decimal::ZERO);
        assert_eq!(next.late_fee, dec!(20));
        assert!(!next.defaulted);
    }

    #[test]
    fn test_overdue_without_default_when_funded() {
        let mut loan = approved_loan();
        let outcome = loan.accrue(T0 + 10 * DAY_MS, dec!(10000), dec!(1000));
        assert!(!outcome.defaulted);
        assert_eq!(loan.status, LoanStatus::Approved);
    }

    #[test]
    fn test_payment_priority() {
        let mut loan = approved_loan();
        loan.late_payment_fees_accrued = dec!(20);
        loan.overdue_interest_accrued = dec!(0.2);
        loan.accrued_interest = dec!(10);

        let alloc = loan.apply_payment(dec!(50), RepaymentRecorder::Admin, T0);
        assert_eq!(alloc.late_fees, dec!(20));
        assert_eq!(alloc.overdue_interest, dec!(0.2));
        assert_eq!(alloc.interest, dec!(10));
        assert_eq!(alloc.principal, dec!(19.8));
        assert_eq!(loan.outstanding_principal, dec!(980.2));
        assert_eq!(loan.status, LoanStatus::Approved);
        assert_eq!(loan.repayment_history.len(), 1);
        assert_eq!(loan.repayment_history[0].kind, RepaymentKind::Partial);
    }

    #[test]
    fn test_overpayment_stops_at_total_owed() {
        let mut loan = approved_loan();
        loan.accrued_interest = dec!(10);

        let alloc = loan.apply_payment(dec!(2000), RepaymentRecorder::Admin, T0);
        assert_eq!(alloc.applied(), dec!(1010));
        assert!(loan.is_fully_repaid());
        assert_eq!(loan.status, LoanStatus::Repaid);
        assert_eq!(loan.repayment_history[0].kind, RepaymentKind::Full);
    }

    #[test]
    fn test_final_states() {
        assert!(LoanStatus::Repaid.is_final());
        assert!(LoanStatus::Defaulted.is_final());
        assert!(LoanStatus::Rejected.is_final());
        assert!(!LoanStatus::Approved.is_final());
        assert!(!LoanStatus::PendingApproval.is_final());
    }
}
