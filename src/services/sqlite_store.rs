//! SQLite persistence for accounts, trades, positions, loans and robot orders.
//!
//! Money columns are decimal TEXT. Every row helper takes a `&Connection` so
//! callers can compose several of them inside one `BEGIN IMMEDIATE`
//! transaction via [`SqliteStore::with_transaction`]. Status transitions that
//! may race are written as conditional updates and report whether they won.

use crate::error::{LedgerError, Result};
use crate::types::{
    Account, ContractPosition, ContractSide, FundRequest, FundStatus, Loan, LoanRepaymentRequest,
    LoanStatus, Notification, OptionResolution, OptionStatus, OptionTrade, PositionStatus,
    RepaymentRequestStatus, RobotOrder, RobotOrderStatus, RobotPackage, SiteSettings,
    TransactionEntry, WithdrawalRequest, WithdrawalStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// How long a writer waits on a locked database file before giving up with
/// `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// SQLite store for all ledger state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Database("connection mutex poisoned".to_string()))
    }

    /// Run `f` against the connection outside an explicit transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. The write lock is taken
    /// up front, so everything `f` reads stays valid until commit. Any error
    /// rolls the whole unit back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                available TEXT NOT NULL DEFAULT '0',
                locked TEXT NOT NULL DEFAULT '0',
                loan TEXT NOT NULL DEFAULT '0',
                loan_limit TEXT NOT NULL DEFAULT '0',
                robot_limit INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                kind TEXT NOT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                reference_id TEXT,
                status TEXT NOT NULL DEFAULT 'completed',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS option_trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                stake TEXT NOT NULL,
                opening_price TEXT NOT NULL,
                purchase_time INTEGER NOT NULL,
                duration_secs INTEGER NOT NULL,
                expiry_time INTEGER NOT NULL,
                return_percentage TEXT NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT,
                expiry_price TEXT,
                payout TEXT,
                admin_outcome TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_option_trades_user ON option_trades(user_id, purchase_time DESC);
            CREATE INDEX IF NOT EXISTS idx_option_trades_expiry ON option_trades(status, expiry_time);

            CREATE TABLE IF NOT EXISTS contract_positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                leverage TEXT NOT NULL,
                opening_price TEXT NOT NULL,
                margin_used TEXT NOT NULL,
                take_profit_price TEXT,
                stop_loss_price TEXT,
                liquidation_price TEXT NOT NULL,
                status TEXT NOT NULL,
                opening_time INTEGER NOT NULL,
                closing_price TEXT,
                closing_time INTEGER,
                realized_pnl TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON contract_positions(status);
            CREATE INDEX IF NOT EXISTS idx_positions_user ON contract_positions(user_id);

            CREATE TABLE IF NOT EXISTS loans (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                loan_amount TEXT NOT NULL,
                outstanding_principal TEXT NOT NULL,
                term_days INTEGER NOT NULL,
                daily_interest_rate TEXT NOT NULL,
                accrued_interest TEXT NOT NULL,
                overdue_interest_accrued TEXT NOT NULL,
                late_payment_fees_accrued TEXT NOT NULL,
                amount_repaid TEXT NOT NULL,
                status TEXT NOT NULL,
                loan_date INTEGER NOT NULL,
                approval_date INTEGER,
                due_date INTEGER,
                repaid_date INTEGER,
                disable_interest_accrual INTEGER NOT NULL DEFAULT 0,
                disable_late_fees_accrual INTEGER NOT NULL DEFAULT 0,
                last_interest_accrual_date INTEGER,
                last_overdue_charge_date INTEGER,
                admin_notes TEXT,
                repayment_history_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_loans_status ON loans(status);
            CREATE INDEX IF NOT EXISTS idx_loans_user ON loans(user_id);

            CREATE TABLE IF NOT EXISTS repayment_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                loan_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                request_date INTEGER NOT NULL,
                decided_at INTEGER,
                admin_notes TEXT
            );

            CREATE TABLE IF NOT EXISTS robot_packages (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                min_investment TEXT NOT NULL,
                max_investment TEXT NOT NULL,
                min_daily_return_pct TEXT NOT NULL,
                max_daily_return_pct TEXT NOT NULL,
                cycle_days INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS robot_orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                package_id TEXT NOT NULL,
                investment TEXT NOT NULL,
                asset TEXT NOT NULL,
                min_daily_return_pct TEXT NOT NULL,
                max_daily_return_pct TEXT NOT NULL,
                cycle_days INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                status TEXT NOT NULL,
                total_profit TEXT NOT NULL,
                last_profit_distribution INTEGER,
                daily_revenue_json TEXT NOT NULL DEFAULT '[]',
                redemption_date INTEGER,
                redeemed_amount TEXT NOT NULL DEFAULT '0'
            );
            CREATE INDEX IF NOT EXISTS idx_robot_orders_status ON robot_orders(status);
            CREATE INDEX IF NOT EXISTS idx_robot_orders_user ON robot_orders(user_id);

            CREATE TABLE IF NOT EXISTS fund_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                chain_name TEXT NOT NULL,
                payment_proof TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS withdrawal_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                chain_name TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount_in_usd TEXT,
                status TEXT NOT NULL,
                is_approved_once INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS site_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                settings_json TEXT NOT NULL
            );",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }
}

// ========== Column Helpers ==========

fn conversion_err(idx: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn dec(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_err(idx, e))
}

fn opt_dec(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Decimal::from_str(&t).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn text_enum<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_err(idx, e))
}

fn opt_text_enum<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e: String| conversion_err(idx, e)))
        .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_err(idx, e))
}

fn opt_str(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

// ========== Accounts ==========

const ACCOUNT_COLUMNS: &str =
    "user_id, available, locked, loan, loan_limit, robot_limit, created_at, updated_at";

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        user_id: row.get(0)?,
        available: dec(row, 1)?,
        locked: dec(row, 2)?,
        loan: dec(row, 3)?,
        loan_limit: dec(row, 4)?,
        robot_limit: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn get_account(conn: &Connection, user_id: &str) -> Result<Option<Account>> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1");
    Ok(conn
        .query_row(&sql, params![user_id], row_to_account)
        .optional()?)
}

pub fn require_account(conn: &Connection, user_id: &str) -> Result<Account> {
    get_account(conn, user_id)?.ok_or_else(|| LedgerError::not_found("account", user_id))
}

/// Insert a zeroed account unless one exists. Returns true if created.
pub fn insert_account(conn: &Connection, account: &Account) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO accounts
         (user_id, available, locked, loan, loan_limit, robot_limit, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            account.user_id,
            account.available.to_string(),
            account.locked.to_string(),
            account.loan.to_string(),
            account.loan_limit.to_string(),
            account.robot_limit,
            account.created_at,
            account.updated_at,
        ],
    )?;
    Ok(changed == 1)
}

/// Overwrite the three balances. Only called from the ledger inside a
/// write transaction.
pub(crate) fn write_balances(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET available = ?1, locked = ?2, loan = ?3, updated_at = ?4
         WHERE user_id = ?5",
        params![
            account.available.to_string(),
            account.locked.to_string(),
            account.loan.to_string(),
            account.updated_at,
            account.user_id,
        ],
    )?;
    Ok(())
}

pub fn set_account_limits(
    conn: &Connection,
    user_id: &str,
    loan_limit: Option<Decimal>,
    robot_limit: Option<u32>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE accounts SET
            loan_limit = COALESCE(?1, loan_limit),
            robot_limit = COALESCE(?2, robot_limit)
         WHERE user_id = ?3",
        params![opt_str(loan_limit), robot_limit, user_id],
    )?;
    Ok(changed == 1)
}

// ========== Transaction Log ==========

pub fn insert_transaction(conn: &Connection, entry: &TransactionEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO transactions
         (id, user_id, amount, kind, category, description, reference_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'completed', ?8)",
        params![
            entry.id,
            entry.user_id,
            entry.amount.to_string(),
            entry.kind.as_str(),
            entry.category.as_str(),
            entry.description,
            entry.reference_id,
            entry.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_transactions(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<TransactionEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, amount, kind, category, description, reference_id, created_at
         FROM transactions WHERE user_id = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, limit as i64], |row| {
        Ok(TransactionEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            amount: dec(row, 2)?,
            kind: text_enum(row, 3)?,
            category: text_enum(row, 4)?,
            description: row.get(5)?,
            reference_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ========== Option Trades ==========

const OPTION_COLUMNS: &str = "id, user_id, symbol, direction, stake, opening_price, purchase_time,
    duration_secs, expiry_time, return_percentage, status, outcome, expiry_price, payout, admin_outcome";

fn row_to_option(row: &Row<'_>) -> rusqlite::Result<OptionTrade> {
    Ok(OptionTrade {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        direction: text_enum(row, 3)?,
        stake: dec(row, 4)?,
        opening_price: dec(row, 5)?,
        purchase_time: row.get(6)?,
        duration_secs: row.get::<_, i64>(7)? as u64,
        expiry_time: row.get(8)?,
        return_percentage: dec(row, 9)?,
        status: text_enum(row, 10)?,
        outcome: opt_text_enum(row, 11)?,
        expiry_price: opt_dec(row, 12)?,
        payout: opt_dec(row, 13)?,
        admin_outcome: opt_text_enum(row, 14)?,
    })
}

pub fn insert_option_trade(conn: &Connection, trade: &OptionTrade) -> Result<()> {
    conn.execute(
        "INSERT INTO option_trades
         (id, user_id, symbol, direction, stake, opening_price, purchase_time, duration_secs,
          expiry_time, return_percentage, status, outcome, expiry_price, payout, admin_outcome)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            trade.id,
            trade.user_id,
            trade.symbol,
            trade.direction.as_str(),
            trade.stake.to_string(),
            trade.opening_price.to_string(),
            trade.purchase_time,
            trade.duration_secs as i64,
            trade.expiry_time,
            trade.return_percentage.to_string(),
            trade.status.as_str(),
            trade.outcome.map(|o| o.as_str()),
            opt_str(trade.expiry_price),
            opt_str(trade.payout),
            trade.admin_outcome.map(|o| o.as_str()),
        ],
    )?;
    Ok(())
}

pub fn get_option_trade(conn: &Connection, id: &str) -> Result<Option<OptionTrade>> {
    let sql = format!("SELECT {OPTION_COLUMNS} FROM option_trades WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_option).optional()?)
}

pub fn list_option_trades(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<OptionTrade>> {
    let sql = format!(
        "SELECT {OPTION_COLUMNS} FROM option_trades WHERE user_id = ?1
         ORDER BY purchase_time DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![user_id, limit as i64], row_to_option)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Active trades whose expiry has passed, optionally for one user.
pub fn list_expired_active_trades(conn: &Connection, user_id: Option<&str>, now_ms: i64) -> Result<Vec<OptionTrade>> {
    let sql = format!(
        "SELECT {OPTION_COLUMNS} FROM option_trades
         WHERE status = ?1 AND expiry_time <= ?2 AND (?3 IS NULL OR user_id = ?3)
         ORDER BY expiry_time ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![OptionStatus::Active.as_str(), now_ms, user_id],
        row_to_option,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Move an Active trade to its terminal state. Returns false if another
/// writer already resolved it.
pub fn resolve_option_trade(conn: &Connection, id: &str, resolution: &OptionResolution) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE option_trades SET status = ?1, outcome = ?2, expiry_price = ?3, payout = ?4
         WHERE id = ?5 AND status = ?6",
        params![
            resolution.status().as_str(),
            resolution.outcome.as_str(),
            resolution.expiry_price.to_string(),
            resolution.payout.to_string(),
            id,
            OptionStatus::Active.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

/// Replace the stake of an Active trade, guarded on the stake read earlier.
pub fn update_option_stake(conn: &Connection, id: &str, previous: Decimal, stake: Decimal) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE option_trades SET stake = ?1 WHERE id = ?2 AND status = ?3 AND stake = ?4",
        params![
            stake.to_string(),
            id,
            OptionStatus::Active.as_str(),
            previous.to_string()
        ],
    )?;
    Ok(changed == 1)
}

pub fn set_option_admin_outcome(conn: &Connection, id: &str, outcome: Option<&str>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE option_trades SET admin_outcome = ?1 WHERE id = ?2 AND status = ?3",
        params![outcome, id, OptionStatus::Active.as_str()],
    )?;
    Ok(changed == 1)
}

// ========== Contract Positions ==========

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, quantity, leverage, opening_price,
    margin_used, take_profit_price, stop_loss_price, liquidation_price, status, opening_time,
    closing_price, closing_time, realized_pnl";

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<ContractPosition> {
    Ok(ContractPosition {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: text_enum::<ContractSide>(row, 3)?,
        quantity: dec(row, 4)?,
        leverage: dec(row, 5)?,
        opening_price: dec(row, 6)?,
        margin_used: dec(row, 7)?,
        take_profit_price: opt_dec(row, 8)?,
        stop_loss_price: opt_dec(row, 9)?,
        liquidation_price: dec(row, 10)?,
        status: text_enum(row, 11)?,
        opening_time: row.get(12)?,
        closing_price: opt_dec(row, 13)?,
        closing_time: row.get(14)?,
        realized_pnl: opt_dec(row, 15)?,
    })
}

pub fn insert_position(conn: &Connection, pos: &ContractPosition) -> Result<()> {
    conn.execute(
        "INSERT INTO contract_positions
         (id, user_id, symbol, side, quantity, leverage, opening_price, margin_used,
          take_profit_price, stop_loss_price, liquidation_price, status, opening_time,
          closing_price, closing_time, realized_pnl)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            pos.id,
            pos.user_id,
            pos.symbol,
            pos.side.as_str(),
            pos.quantity.to_string(),
            pos.leverage.to_string(),
            pos.opening_price.to_string(),
            pos.margin_used.to_string(),
            opt_str(pos.take_profit_price),
            opt_str(pos.stop_loss_price),
            pos.liquidation_price.to_string(),
            pos.status.as_str(),
            pos.opening_time,
            opt_str(pos.closing_price),
            pos.closing_time,
            opt_str(pos.realized_pnl),
        ],
    )?;
    Ok(())
}

pub fn get_position(conn: &Connection, id: &str) -> Result<Option<ContractPosition>> {
    let sql = format!("SELECT {POSITION_COLUMNS} FROM contract_positions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_position).optional()?)
}

/// Open positions, optionally for one user.
pub fn list_open_positions(conn: &Connection, user_id: Option<&str>) -> Result<Vec<ContractPosition>> {
    let sql = format!(
        "SELECT {POSITION_COLUMNS} FROM contract_positions
         WHERE status = ?1 AND (?2 IS NULL OR user_id = ?2)
         ORDER BY opening_time DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![PositionStatus::Open.as_str(), user_id], row_to_position)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_closed_positions(conn: &Connection, user_id: &str) -> Result<Vec<ContractPosition>> {
    let sql = format!(
        "SELECT {POSITION_COLUMNS} FROM contract_positions
         WHERE user_id = ?1 AND status IN (?2, ?3)
         ORDER BY closing_time DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            user_id,
            PositionStatus::Closed.as_str(),
            PositionStatus::Liquidated.as_str()
        ],
        row_to_position,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Close an Open position. Returns false if it was already closed.
pub fn close_position(
    conn: &Connection,
    id: &str,
    status: PositionStatus,
    closing_price: Decimal,
    closing_time: i64,
    realized_pnl: Decimal,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE contract_positions
         SET status = ?1, closing_price = ?2, closing_time = ?3, realized_pnl = ?4
         WHERE id = ?5 AND status = ?6",
        params![
            status.as_str(),
            closing_price.to_string(),
            closing_time,
            realized_pnl.to_string(),
            id,
            PositionStatus::Open.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

pub fn update_position_targets(
    conn: &Connection,
    id: &str,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE contract_positions SET take_profit_price = ?1, stop_loss_price = ?2
         WHERE id = ?3 AND status = ?4",
        params![
            opt_str(take_profit),
            opt_str(stop_loss),
            id,
            PositionStatus::Open.as_str()
        ],
    )?;
    Ok(changed == 1)
}

// ========== Loans ==========

const LOAN_COLUMNS: &str = "id, user_id, loan_amount, outstanding_principal, term_days,
    daily_interest_rate, accrued_interest, overdue_interest_accrued, late_payment_fees_accrued,
    amount_repaid, status, loan_date, approval_date, due_date, repaid_date,
    disable_interest_accrual, disable_late_fees_accrual, last_interest_accrual_date,
    last_overdue_charge_date, admin_notes, repayment_history_json";

fn row_to_loan(row: &Row<'_>) -> rusqlite::Result<Loan> {
    Ok(Loan {
        id: row.get(0)?,
        user_id: row.get(1)?,
        loan_amount: dec(row, 2)?,
        outstanding_principal: dec(row, 3)?,
        term_days: row.get(4)?,
        daily_interest_rate: dec(row, 5)?,
        accrued_interest: dec(row, 6)?,
        overdue_interest_accrued: dec(row, 7)?,
        late_payment_fees_accrued: dec(row, 8)?,
        amount_repaid: dec(row, 9)?,
        status: text_enum(row, 10)?,
        loan_date: row.get(11)?,
        approval_date: row.get(12)?,
        due_date: row.get(13)?,
        repaid_date: row.get(14)?,
        disable_interest_accrual: row.get(15)?,
        disable_late_fees_accrual: row.get(16)?,
        last_interest_accrual_date: row.get(17)?,
        last_overdue_charge_date: row.get(18)?,
        admin_notes: row.get(19)?,
        repayment_history: json_col(row, 20)?,
    })
}

pub fn insert_loan(conn: &Connection, loan: &Loan) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO loans ({LOAN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            loan.id,
            loan.user_id,
            loan.loan_amount.to_string(),
            loan.outstanding_principal.to_string(),
            loan.term_days,
            loan.daily_interest_rate.to_string(),
            loan.accrued_interest.to_string(),
            loan.overdue_interest_accrued.to_string(),
            loan.late_payment_fees_accrued.to_string(),
            loan.amount_repaid.to_string(),
            loan.status.as_str(),
            loan.loan_date,
            loan.approval_date,
            loan.due_date,
            loan.repaid_date,
            loan.disable_interest_accrual,
            loan.disable_late_fees_accrual,
            loan.last_interest_accrual_date,
            loan.last_overdue_charge_date,
            loan.admin_notes,
            serde_json::to_string(&loan.repayment_history)?,
        ],
    )?;
    Ok(())
}

pub fn get_loan(conn: &Connection, id: &str) -> Result<Option<Loan>> {
    let sql = format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_loan).optional()?)
}

pub fn list_user_loans(conn: &Connection, user_id: &str) -> Result<Vec<Loan>> {
    let sql = format!("SELECT {LOAN_COLUMNS} FROM loans WHERE user_id = ?1 ORDER BY loan_date DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![user_id], row_to_loan)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_loans_by_status(conn: &Connection, statuses: &[LoanStatus]) -> Result<Vec<Loan>> {
    let placeholders = (1..=statuses.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {LOAN_COLUMNS} FROM loans WHERE status IN ({placeholders}) ORDER BY loan_date ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
        row_to_loan,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Persist every mutable loan field, guarded on the status read earlier.
pub fn update_loan(conn: &Connection, loan: &Loan, expected: LoanStatus) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE loans SET
            outstanding_principal = ?1, term_days = ?2, accrued_interest = ?3,
            overdue_interest_accrued = ?4, late_payment_fees_accrued = ?5, amount_repaid = ?6,
            status = ?7, approval_date = ?8, due_date = ?9, repaid_date = ?10,
            disable_interest_accrual = ?11, disable_late_fees_accrual = ?12,
            last_interest_accrual_date = ?13, last_overdue_charge_date = ?14,
            admin_notes = ?15, repayment_history_json = ?16
         WHERE id = ?17 AND status = ?18",
        params![
            loan.outstanding_principal.to_string(),
            loan.term_days,
            loan.accrued_interest.to_string(),
            loan.overdue_interest_accrued.to_string(),
            loan.late_payment_fees_accrued.to_string(),
            loan.amount_repaid.to_string(),
            loan.status.as_str(),
            loan.approval_date,
            loan.due_date,
            loan.repaid_date,
            loan.disable_interest_accrual,
            loan.disable_late_fees_accrual,
            loan.last_interest_accrual_date,
            loan.last_overdue_charge_date,
            loan.admin_notes,
            serde_json::to_string(&loan.repayment_history)?,
            loan.id,
            expected.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

// ========== Repayment Requests ==========

fn row_to_repayment(row: &Row<'_>) -> rusqlite::Result<LoanRepaymentRequest> {
    Ok(LoanRepaymentRequest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        loan_id: row.get(2)?,
        amount: dec(row, 3)?,
        status: text_enum(row, 4)?,
        request_date: row.get(5)?,
        decided_at: row.get(6)?,
        admin_notes: row.get(7)?,
    })
}

pub fn insert_repayment_request(conn: &Connection, req: &LoanRepaymentRequest) -> Result<()> {
    conn.execute(
        "INSERT INTO repayment_requests
         (id, user_id, loan_id, amount, status, request_date, decided_at, admin_notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            req.id,
            req.user_id,
            req.loan_id,
            req.amount.to_string(),
            req.status.as_str(),
            req.request_date,
            req.decided_at,
            req.admin_notes,
        ],
    )?;
    Ok(())
}

pub fn get_repayment_request(conn: &Connection, id: &str) -> Result<Option<LoanRepaymentRequest>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, loan_id, amount, status, request_date, decided_at, admin_notes
             FROM repayment_requests WHERE id = ?1",
            params![id],
            row_to_repayment,
        )
        .optional()?)
}

/// Decide a Pending request. Returns false if it was already decided.
pub fn decide_repayment_request(
    conn: &Connection,
    id: &str,
    status: RepaymentRequestStatus,
    decided_at: i64,
    notes: Option<&str>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE repayment_requests SET status = ?1, decided_at = ?2, admin_notes = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            status.as_str(),
            decided_at,
            notes,
            id,
            RepaymentRequestStatus::Pending.as_str()
        ],
    )?;
    Ok(changed == 1)
}

// ========== Robot Packages & Orders ==========

pub fn insert_robot_package(conn: &Connection, package: &RobotPackage) -> Result<()> {
    conn.execute(
        "INSERT INTO robot_packages
         (id, name, min_investment, max_investment, min_daily_return_pct, max_daily_return_pct,
          cycle_days, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            package.id,
            package.name,
            package.min_investment.to_string(),
            package.max_investment.to_string(),
            package.min_daily_return_pct.to_string(),
            package.max_daily_return_pct.to_string(),
            package.cycle_days,
            package.is_active,
        ],
    )?;
    Ok(())
}

const PACKAGE_COLUMNS: &str = "id, name, min_investment, max_investment, min_daily_return_pct,
    max_daily_return_pct, cycle_days, is_active";

fn row_to_package(row: &Row<'_>) -> rusqlite::Result<RobotPackage> {
    Ok(RobotPackage {
        id: row.get(0)?,
        name: row.get(1)?,
        min_investment: dec(row, 2)?,
        max_investment: dec(row, 3)?,
        min_daily_return_pct: dec(row, 4)?,
        max_daily_return_pct: dec(row, 5)?,
        cycle_days: row.get(6)?,
        is_active: row.get(7)?,
    })
}

pub fn get_robot_package(conn: &Connection, id: &str) -> Result<Option<RobotPackage>> {
    let sql = format!("SELECT {PACKAGE_COLUMNS} FROM robot_packages WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_package).optional()?)
}

pub fn list_robot_packages(conn: &Connection, active_only: bool) -> Result<Vec<RobotPackage>> {
    let sql = format!(
        "SELECT {PACKAGE_COLUMNS} FROM robot_packages WHERE (?1 = 0 OR is_active = 1) ORDER BY name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![active_only], row_to_package)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_robot_package_active(conn: &Connection, id: &str, active: bool) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE robot_packages SET is_active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    Ok(changed == 1)
}

const ROBOT_COLUMNS: &str = "id, user_id, package_id, investment, asset, min_daily_return_pct,
    max_daily_return_pct, cycle_days, start_time, end_time, status, total_profit,
    last_profit_distribution, daily_revenue_json, redemption_date, redeemed_amount";

fn row_to_robot_order(row: &Row<'_>) -> rusqlite::Result<RobotOrder> {
    Ok(RobotOrder {
        id: row.get(0)?,
        user_id: row.get(1)?,
        package_id: row.get(2)?,
        investment: dec(row, 3)?,
        asset: row.get(4)?,
        min_daily_return_pct: dec(row, 5)?,
        max_daily_return_pct: dec(row, 6)?,
        cycle_days: row.get(7)?,
        start_time: row.get(8)?,
        end_time: row.get(9)?,
        status: text_enum(row, 10)?,
        total_profit: dec(row, 11)?,
        last_profit_distribution: row.get(12)?,
        daily_revenue: json_col(row, 13)?,
        redemption_date: row.get(14)?,
        redeemed_amount: dec(row, 15)?,
    })
}

pub fn insert_robot_order(conn: &Connection, order: &RobotOrder) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO robot_orders ({ROBOT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            order.id,
            order.user_id,
            order.package_id,
            order.investment.to_string(),
            order.asset,
            order.min_daily_return_pct.to_string(),
            order.max_daily_return_pct.to_string(),
            order.cycle_days,
            order.start_time,
            order.end_time,
            order.status.as_str(),
            order.total_profit.to_string(),
            order.last_profit_distribution,
            serde_json::to_string(&order.daily_revenue)?,
            order.redemption_date,
            order.redeemed_amount.to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_robot_order(conn: &Connection, id: &str) -> Result<Option<RobotOrder>> {
    let sql = format!("SELECT {ROBOT_COLUMNS} FROM robot_orders WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_robot_order).optional()?)
}

pub fn list_robot_orders(
    conn: &Connection,
    user_id: Option<&str>,
    status: Option<RobotOrderStatus>,
) -> Result<Vec<RobotOrder>> {
    let sql = format!(
        "SELECT {ROBOT_COLUMNS} FROM robot_orders
         WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY start_time DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![user_id, status.map(|s| s.as_str())],
        row_to_robot_order,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_robot_orders(conn: &Connection, user_id: &str, status: RobotOrderStatus) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM robot_orders WHERE user_id = ?1 AND status = ?2",
        params![user_id, status.as_str()],
        |row| row.get(0),
    )?)
}

/// Persist distribution and lifecycle fields, guarded on the status read earlier.
pub fn update_robot_order(conn: &Connection, order: &RobotOrder, expected: RobotOrderStatus) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE robot_orders SET
            status = ?1, total_profit = ?2, last_profit_distribution = ?3,
            daily_revenue_json = ?4, redemption_date = ?5, redeemed_amount = ?6
         WHERE id = ?7 AND status = ?8",
        params![
            order.status.as_str(),
            order.total_profit.to_string(),
            order.last_profit_distribution,
            serde_json::to_string(&order.daily_revenue)?,
            order.redemption_date,
            order.redeemed_amount.to_string(),
            order.id,
            expected.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

// ========== Fund & Withdrawal Requests ==========

pub fn insert_fund_request(conn: &Connection, req: &FundRequest) -> Result<()> {
    conn.execute(
        "INSERT INTO fund_requests
         (id, user_id, amount, currency, chain_name, payment_proof, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            req.id,
            req.user_id,
            req.amount.to_string(),
            req.currency,
            req.chain_name,
            req.payment_proof,
            req.status.as_str(),
            req.created_at,
            req.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_fund_request(conn: &Connection, id: &str) -> Result<Option<FundRequest>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, amount, currency, chain_name, payment_proof, status,
                    created_at, updated_at
             FROM fund_requests WHERE id = ?1",
            params![id],
            |row| {
                Ok(FundRequest {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: dec(row, 2)?,
                    currency: row.get(3)?,
                    chain_name: row.get(4)?,
                    payment_proof: row.get(5)?,
                    status: text_enum(row, 6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .optional()?)
}

pub fn set_fund_status(
    conn: &Connection,
    id: &str,
    status: FundStatus,
    expected: FundStatus,
    now_ms: i64,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE fund_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![status.as_str(), now_ms, id, expected.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn insert_withdrawal_request(conn: &Connection, req: &WithdrawalRequest) -> Result<()> {
    conn.execute(
        "INSERT INTO withdrawal_requests
         (id, user_id, amount, currency, chain_name, to_address, amount_in_usd, status,
          is_approved_once, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            req.id,
            req.user_id,
            req.amount.to_string(),
            req.currency,
            req.chain_name,
            req.to_address,
            opt_str(req.amount_in_usd),
            req.status.as_str(),
            req.is_approved_once,
            req.created_at,
            req.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_withdrawal_request(conn: &Connection, id: &str) -> Result<Option<WithdrawalRequest>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, amount, currency, chain_name, to_address, amount_in_usd, status,
                    is_approved_once, created_at, updated_at
             FROM withdrawal_requests WHERE id = ?1",
            params![id],
            |row| {
                Ok(WithdrawalRequest {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: dec(row, 2)?,
                    currency: row.get(3)?,
                    chain_name: row.get(4)?,
                    to_address: row.get(5)?,
                    amount_in_usd: opt_dec(row, 6)?,
                    status: text_enum(row, 7)?,
                    is_approved_once: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            },
        )
        .optional()?)
}

/// Write a status change, guarded on the status read earlier.
pub fn update_withdrawal(
    conn: &Connection,
    req: &WithdrawalRequest,
    expected: WithdrawalStatus,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE withdrawal_requests
         SET status = ?1, amount_in_usd = ?2, is_approved_once = ?3, updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        params![
            req.status.as_str(),
            opt_str(req.amount_in_usd),
            req.is_approved_once,
            req.updated_at,
            req.id,
            expected.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

// ========== Notifications ==========

pub fn insert_notification(conn: &Connection, notification: &Notification) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications (id, user_id, level, message, read, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            notification.id,
            notification.user_id,
            notification.level.as_str(),
            notification.message,
            notification.read,
            notification.timestamp,
        ],
    )?;
    Ok(())
}

pub fn list_notifications(conn: &Connection, user_id: &str) -> Result<Vec<Notification>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, level, message, read, timestamp
         FROM notifications WHERE user_id = ?1 ORDER BY timestamp DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![user_id], |row| {
        Ok(Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            level: text_enum(row, 2)?,
            message: row.get(3)?,
            read: row.get(4)?,
            timestamp: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ========== Site Settings ==========

pub fn get_settings(conn: &Connection) -> Result<SiteSettings> {
    let json: Option<String> = conn
        .query_row("SELECT settings_json FROM site_settings WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(SiteSettings::default()),
    }
}

pub fn save_settings(conn: &Connection, settings: &SiteSettings) -> Result<()> {
    conn.execute(
        "INSERT INTO site_settings (id, settings_json) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET settings_json = excluded.settings_json",
        params![serde_json::to_string(settings)?],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminOutcome, OptionDirection, TradeOutcome};
    use rust_decimal_macros::dec;

    fn trade() -> OptionTrade {
        OptionTrade::new(
            "user-1".to_string(),
            "BTC/USD".to_string(),
            OptionDirection::Bullish,
            dec!(100),
            dec!(50000.12345678),
            1_000,
            120,
            dec!(92),
        )
    }

    #[test]
    fn test_account_roundtrip_keeps_precision() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut account = Account::new("user-1".to_string());
        account.available = dec!(0.1);
        account.locked = dec!(0.2);

        store
            .with_transaction(|tx| {
                assert!(insert_account(tx, &account)?);
                assert!(!insert_account(tx, &account)?);
                Ok(())
            })
            .unwrap();

        let loaded = store.with_conn(|c| require_account(c, "user-1")).unwrap();
        assert_eq!(loaded.total(), dec!(0.3));
    }

    #[test]
    fn test_missing_account() {
        let store = SqliteStore::new_in_memory().unwrap();
        let err = store.with_conn(|c| require_account(c, "ghost")).unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
    }

    #[test]
    fn test_option_resolution_is_guarded() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut t = trade();
        t.admin_outcome = Some(AdminOutcome::Loss);
        store.with_conn(|c| insert_option_trade(c, &t)).unwrap();

        let resolution = t.resolve(dec!(1), || false);
        assert_eq!(resolution.outcome, TradeOutcome::Loss);

        let first = store.with_conn(|c| resolve_option_trade(c, &t.id, &resolution)).unwrap();
        let second = store.with_conn(|c| resolve_option_trade(c, &t.id, &resolution)).unwrap();
        assert!(first);
        assert!(!second);

        let stored = store.with_conn(|c| get_option_trade(c, &t.id)).unwrap().unwrap();
        assert_eq!(stored.status, OptionStatus::ExpiredLoss);
        assert_eq!(stored.opening_price, dec!(50000.12345678));
        assert_eq!(stored.admin_outcome, Some(AdminOutcome::Loss));
    }

    #[test]
    fn test_expired_listing() {
        let store = SqliteStore::new_in_memory().unwrap();
        let t = trade();
        store.with_conn(|c| insert_option_trade(c, &t)).unwrap();

        let none = store
            .with_conn(|c| list_expired_active_trades(c, Some("user-1"), t.expiry_time - 1))
            .unwrap();
        assert!(none.is_empty());

        let due = store
            .with_conn(|c| list_expired_active_trades(c, None, t.expiry_time))
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = SqliteStore::new_in_memory().unwrap();
        let result: Result<()> = store.with_transaction(|tx| {
            insert_account(tx, &Account::new("user-1".to_string()))?;
            Err(LedgerError::Validation("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(store.with_conn(|c| get_account(c, "user-1")).unwrap().is_none());
    }

    #[test]
    fn test_loan_status_listing() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut approved = Loan::new("user-1".to_string(), dec!(1000), 7, dec!(1), 0);
        approved.approve(10);
        let pending = Loan::new("user-1".to_string(), dec!(500), 7, dec!(1), 0);
        store
            .with_transaction(|tx| {
                insert_loan(tx, &approved)?;
                insert_loan(tx, &pending)
            })
            .unwrap();

        let active = store
            .with_conn(|c| list_loans_by_status(c, &[LoanStatus::Approved, LoanStatus::Defaulted]))
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, approved.id);
    }

    #[test]
    fn test_settings_default_then_saved() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut settings = store.with_conn(get_settings).unwrap();
        assert_eq!(settings, SiteSettings::default());

        settings.loan_term_rates.insert(30, dec!(0.5));
        store.with_conn(|c| save_settings(c, &settings)).unwrap();
        let loaded = store.with_conn(get_settings).unwrap();
        assert_eq!(loaded.loan_rate(30), Some(dec!(0.5)));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let mut account = Account::new("user-1".to_string());
        account.available = dec!(42.5);
        {
            let store = SqliteStore::new(&path).unwrap();
            store.with_transaction(|tx| insert_account(tx, &account)).unwrap();
        }

        let reopened = SqliteStore::new(&path).unwrap();
        let loaded = reopened
            .with_conn(|c| get_account(c, "user-1"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.available, dec!(42.5));
    }
}
