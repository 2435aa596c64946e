//! Account ledger primitives.
//!
//! Every balance movement goes through [`apply_change`], which must run inside
//! a write transaction. It re-reads the account, checks the non-negativity
//! invariants, and writes all three balances back in one statement. Composite
//! settlements call it several times inside the same transaction together with
//! their entity updates, so a settlement either lands completely or not at all.

use crate::error::{LedgerError, Result};
use crate::services::sqlite_store::{self as db, SqliteStore};
use crate::types::{now_ms, Account, TransactionEntry, TxCategory, TxKind};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

/// One atomic balance movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceChange {
    /// available -> locked
    Reserve(Decimal),
    /// locked -> available, no payout
    Release(Decimal),
    /// Remove `locked` from locked and add `payout` to available. A negative
    /// payout that would take available below zero is floored at zero.
    Settle { locked: Decimal, payout: Decimal },
    /// Display aggregate only, clamped at zero
    LoanAggregate(Decimal),
    Credit(Decimal),
    Debit(Decimal),
}

/// Account state after a change.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub account: Account,
    /// Part of a negative settle payout that could not be taken from available
    pub shortfall: Decimal,
}

fn positive(amount: Decimal, what: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!("{what} must be positive, got {amount}")));
    }
    Ok(())
}

fn require_locked(account: &Account, amount: Decimal) -> Result<()> {
    if account.locked < amount {
        return Err(LedgerError::InvalidState(format!(
            "locked balance {} below {} for {}",
            account.locked, amount, account.user_id
        )));
    }
    Ok(())
}

/// Apply `change` to `user_id`'s balances. Callers hold a write transaction.
pub fn apply_change(conn: &Connection, user_id: &str, change: BalanceChange) -> Result<Applied> {
    let mut account = db::require_account(conn, user_id)?;
    let mut shortfall = Decimal::ZERO;

    match change {
        BalanceChange::Reserve(amount) => {
            positive(amount, "reserve amount")?;
            if account.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available: account.available,
                });
            }
            account.available -= amount;
            account.locked += amount;
        }
        BalanceChange::Release(amount) => {
            positive(amount, "release amount")?;
            require_locked(&account, amount)?;
            account.locked -= amount;
            account.available += amount;
        }
        BalanceChange::Settle { locked, payout } => {
            require_locked(&account, locked)?;
            account.locked -= locked;
            account.available += payout;
            if account.available < Decimal::ZERO {
                shortfall = -account.available;
                account.available = Decimal::ZERO;
                warn!(
                    "Settlement for {} exceeded available by {}, floored at zero",
                    user_id, shortfall
                );
            }
        }
        BalanceChange::LoanAggregate(delta) => {
            account.loan = (account.loan + delta).max(Decimal::ZERO);
        }
        BalanceChange::Credit(amount) => {
            positive(amount, "credit amount")?;
            account.available += amount;
        }
        BalanceChange::Debit(amount) => {
            positive(amount, "debit amount")?;
            if account.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available: account.available,
                });
            }
            account.available -= amount;
        }
    }

    account.updated_at = now_ms();
    db::write_balances(conn, &account)?;
    debug!("{:?} applied to {}", change, user_id);
    Ok(Applied { account, shortfall })
}

/// Append a completed credit or debit to the transaction log.
pub fn append_log(conn: &Connection, entry: &TransactionEntry) -> Result<()> {
    db::insert_transaction(conn, entry)
}

/// Ledger entry points that each run in their own transaction.
#[derive(Clone)]
pub struct AccountLedger {
    store: Arc<SqliteStore>,
}

impl AccountLedger {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Create a zeroed account if none exists and return the current one.
    pub fn ensure_account(&self, user_id: &str) -> Result<Account> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user id is empty".to_string()));
        }
        self.store.with_transaction(|tx| {
            if db::insert_account(tx, &Account::new(user_id.to_string()))? {
                debug!("Created account for {}", user_id);
            }
            db::require_account(tx, user_id)
        })
    }

    pub fn account(&self, user_id: &str) -> Result<Account> {
        self.store.with_conn(|c| db::require_account(c, user_id))
    }

    pub fn reserve(&self, user_id: &str, amount: Decimal) -> Result<Account> {
        self.apply(user_id, BalanceChange::Reserve(amount))
    }

    pub fn release(&self, user_id: &str, amount: Decimal) -> Result<Account> {
        self.apply(user_id, BalanceChange::Release(amount))
    }

    pub fn settle(&self, user_id: &str, locked: Decimal, payout: Decimal) -> Result<Applied> {
        self.store
            .with_transaction(|tx| apply_change(tx, user_id, BalanceChange::Settle { locked, payout }))
    }

    pub fn adjust_loan_aggregate(&self, user_id: &str, delta: Decimal) -> Result<Account> {
        self.apply(user_id, BalanceChange::LoanAggregate(delta))
    }

    /// Credit available and log it in the same transaction.
    pub fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        category: TxCategory,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Account> {
        self.logged(user_id, BalanceChange::Credit(amount), TxKind::Credit, category, description, reference_id)
    }

    /// Debit available and log it in the same transaction.
    pub fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        category: TxCategory,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Account> {
        self.logged(user_id, BalanceChange::Debit(amount), TxKind::Debit, category, description, reference_id)
    }

    pub fn set_limits(&self, user_id: &str, loan_limit: Option<Decimal>, robot_limit: Option<u32>) -> Result<Account> {
        if loan_limit.is_some_and(|l| l < Decimal::ZERO) {
            return Err(LedgerError::Validation("loan limit cannot be negative".to_string()));
        }
        self.store.with_transaction(|tx| {
            if !db::set_account_limits(tx, user_id, loan_limit, robot_limit)? {
                return Err(LedgerError::not_found("account", user_id));
            }
            db::require_account(tx, user_id)
        })
    }

    pub fn transactions(&self, user_id: &str, limit: usize) -> Result<Vec<TransactionEntry>> {
        self.store.with_conn(|c| db::list_transactions(c, user_id, limit))
    }

    fn apply(&self, user_id: &str, change: BalanceChange) -> Result<Account> {
        self.store
            .with_transaction(|tx| apply_change(tx, user_id, change).map(|a| a.account))
    }

    fn logged(
        &self,
        user_id: &str,
        change: BalanceChange,
        kind: TxKind,
        category: TxCategory,
        description: &str,
        reference_id: Option<&str>,
    ) -> Result<Account> {
        let amount = match change {
            BalanceChange::Credit(a) | BalanceChange::Debit(a) => a,
            _ => Decimal::ZERO,
        };
        self.store.with_transaction(|tx| {
            let applied = apply_change(tx, user_id, change)?;
            append_log(
                tx,
                &TransactionEntry::new(user_id, amount, kind, category, description, reference_id),
            )?;
            Ok(applied.account)
        })
    }
}
