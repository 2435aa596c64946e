use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Ledger error types.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::EntityNotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether a retry of the same unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientConflict(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::Validation(_) => "VALIDATION",
            LedgerError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            LedgerError::TransientConflict(_) => "TRANSIENT_CONFLICT",
            LedgerError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// HTTP-equivalent status for the failure.
    pub fn status(&self) -> u16 {
        match self {
            LedgerError::InsufficientFunds { .. }
            | LedgerError::InvalidState(_)
            | LedgerError::Validation(_) => 400,
            LedgerError::EntityNotFound { .. } => 404,
            LedgerError::TransientConflict(_) => 409,
            LedgerError::UpstreamUnavailable(_) => 502,
            LedgerError::Database(_) => 500,
        }
    }

    /// Convert into the single structured failure returned to callers.
    pub fn to_failure(&self) -> FailureResponse {
        FailureResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            status: self.status(),
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                LedgerError::TransientConflict(e.to_string())
            }
            _ => LedgerError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Database(format!("corrupt json column: {}", e))
    }
}

/// Structured failure body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailureResponse {
    pub error: String,
    pub code: String,
    pub status: u16,
}

pub type Result<T> = std::result::Result<T, LedgerError>;
