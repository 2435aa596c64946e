use super::{CloseTrigger, ContractSide, OptionDirection, TradeOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settlement event pushed to the admin trade feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TradePlaced {
        trade_id: String,
        user_id: String,
        symbol: String,
        direction: OptionDirection,
        stake: Decimal,
        expiry_time: i64,
    },
    TradeSettled {
        trade_id: String,
        user_id: String,
        outcome: TradeOutcome,
        payout: Decimal,
        expiry_price: Decimal,
    },
    PositionOpened {
        position_id: String,
        user_id: String,
        symbol: String,
        side: ContractSide,
        margin: Decimal,
    },
    PositionClosed {
        position_id: String,
        user_id: String,
        trigger: CloseTrigger,
        closing_price: Decimal,
        realized_pnl: Decimal,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

/// Message accepted from an admin feed client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedCommand {
    Ping,
    /// Restrict the feed to one user's events (None = everyone)
    Watch {
        #[serde(default)]
        user_id: Option<String>,
    },
}

impl LedgerEvent {
    /// User the event belongs to, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            LedgerEvent::TradePlaced { user_id, .. }
            | LedgerEvent::TradeSettled { user_id, .. }
            | LedgerEvent::PositionOpened { user_id, .. }
            | LedgerEvent::PositionClosed { user_id, .. } => Some(user_id),
            LedgerEvent::Pong { .. } | LedgerEvent::Error { .. } => None,
        }
    }
}
