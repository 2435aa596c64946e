//! Leveraged contract positions.

use super::{new_id, round_money};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Maintenance margin used when the site settings carry none.
pub const DEFAULT_MAINTENANCE_MARGIN: Decimal = dec!(0.005);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractSide {
    Buy,
    Sell,
}

string_enum!(ContractSide {
    Buy => "Buy",
    Sell => "Sell",
});

impl ContractSide {
    /// +1 for long, -1 for short.
    pub fn factor(&self) -> Decimal {
        match self {
            ContractSide::Buy => Decimal::ONE,
            ContractSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

string_enum!(PositionStatus {
    Open => "Open",
    Closed => "Closed",
    Liquidated => "Liquidated",
});

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    Liquidation,
    TakeProfit,
    StopLoss,
    Manual,
}

string_enum!(CloseTrigger {
    Liquidation => "liquidation",
    TakeProfit => "take_profit",
    StopLoss => "stop_loss",
    Manual => "manual",
});

impl CloseTrigger {
    pub fn final_status(&self) -> PositionStatus {
        match self {
            CloseTrigger::Liquidation => PositionStatus::Liquidated,
            _ => PositionStatus::Closed,
        }
    }
}

fn overflow(what: &str) -> LedgerError {
    LedgerError::Validation(format!("{what} is out of range"))
}

/// Liquidation price from leverage and maintenance margin.
///
/// Buy: `open × (1 − 1/leverage + mm)`, Sell: `open × (1 + 1/leverage − mm)`.
pub fn liquidation_price(
    side: ContractSide,
    opening_price: Decimal,
    leverage: Decimal,
    maintenance_margin: Decimal,
) -> Result<Decimal> {
    let inv = Decimal::ONE
        .checked_div(leverage)
        .ok_or_else(|| overflow("leverage"))?;
    let factor = match side {
        ContractSide::Buy => (Decimal::ONE - inv).checked_add(maintenance_margin),
        ContractSide::Sell => (Decimal::ONE + inv).checked_sub(maintenance_margin),
    }
    .ok_or_else(|| overflow("maintenance margin"))?;
    opening_price
        .checked_mul(factor)
        .map(round_money)
        .ok_or_else(|| overflow("liquidation price"))
}

/// A leveraged long or short position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractPosition {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: ContractSide,
    pub quantity: Decimal,
    pub leverage: Decimal,
    pub opening_price: Decimal,
    /// Collateral held in the locked balance
    pub margin_used: Decimal,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub liquidation_price: Decimal,
    pub status: PositionStatus,
    pub opening_time: i64,
    pub closing_price: Option<Decimal>,
    pub closing_time: Option<i64>,
    pub realized_pnl: Option<Decimal>,
}

/// Balance movement produced by closing a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractSettlement {
    pub trigger: CloseTrigger,
    pub closing_price: Decimal,
    pub realized_pnl: Decimal,
    pub fee: Decimal,
    /// Amount removed from locked (the margin)
    pub released: Decimal,
    /// Amount added to available; may be negative on a liquidation
    pub credit: Decimal,
}

impl ContractPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        user_id: String,
        symbol: String,
        side: ContractSide,
        quantity: Decimal,
        leverage: Decimal,
        opening_price: Decimal,
        maintenance_margin: Decimal,
        take_profit_price: Option<Decimal>,
        stop_loss_price: Option<Decimal>,
        now_ms: i64,
    ) -> Result<Self> {
        let margin_used = opening_price
            .checked_mul(quantity)
            .and_then(|notional| notional.checked_div(leverage))
            .map(round_money)
            .ok_or_else(|| overflow("position size"))?;
        let liquidation_price = liquidation_price(side, opening_price, leverage, maintenance_margin)?;
        Ok(Self {
            id: new_id(),
            user_id,
            symbol,
            side,
            quantity,
            leverage,
            opening_price,
            margin_used,
            take_profit_price,
            stop_loss_price,
            liquidation_price,
            status: PositionStatus::Open,
            opening_time: now_ms,
            closing_price: None,
            closing_time: None,
            realized_pnl: None,
        })
    }

    pub fn is_liquidation_hit(&self, price: Decimal) -> bool {
        match self.side {
            ContractSide::Buy => price <= self.liquidation_price,
            ContractSide::Sell => price >= self.liquidation_price,
        }
    }

    pub fn is_take_profit_hit(&self, price: Decimal) -> bool {
        match (self.take_profit_price, self.side) {
            (Some(tp), ContractSide::Buy) => price >= tp,
            (Some(tp), ContractSide::Sell) => price <= tp,
            (None, _) => false,
        }
    }

    pub fn is_stop_loss_hit(&self, price: Decimal) -> bool {
        match (self.stop_loss_price, self.side) {
            (Some(sl), ContractSide::Buy) => price <= sl,
            (Some(sl), ContractSide::Sell) => price >= sl,
            (None, _) => false,
        }
    }

    /// First matching trigger in priority order: liquidation, take-profit, stop-loss.
    pub fn check_triggers(&self, price: Decimal) -> Option<CloseTrigger> {
        if self.is_liquidation_hit(price) {
            Some(CloseTrigger::Liquidation)
        } else if self.is_take_profit_hit(price) {
            Some(CloseTrigger::TakeProfit)
        } else if self.is_stop_loss_hit(price) {
            Some(CloseTrigger::StopLoss)
        } else {
            None
        }
    }

    pub fn pnl_at(&self, price: Decimal) -> Result<Decimal> {
        price
            .checked_sub(self.opening_price)
            .and_then(|diff| diff.checked_mul(self.quantity))
            .map(|pnl| round_money(pnl * self.side.factor()))
            .ok_or_else(|| overflow("profit and loss"))
    }

    /// Balance movement for closing at `price`.
    ///
    /// A liquidated position forfeits its margin, so only `pnl − fee` is
    /// credited; any other close returns `margin + pnl − fee`.
    pub fn settlement(&self, price: Decimal, trigger: CloseTrigger, fee_pct: Decimal) -> Result<ContractSettlement> {
        let pnl = self.pnl_at(price)?;
        let fee = self
            .margin_used
            .checked_mul(fee_pct)
            .map(|fee| round_money(fee.abs()))
            .ok_or_else(|| overflow("closing fee"))?;
        let credit = match trigger {
            CloseTrigger::Liquidation => pnl.checked_sub(fee),
            _ => self.margin_used.checked_add(pnl).and_then(|c| c.checked_sub(fee)),
        }
        .ok_or_else(|| overflow("settlement credit"))?;
        Ok(ContractSettlement {
            trigger,
            closing_price: price,
            realized_pnl: pnl,
            fee,
            released: self.margin_used,
            credit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(tp: Option<Decimal>, sl: Option<Decimal>) -> ContractPosition {
        ContractPosition::open(
            "user-1".to_string(),
            "BTC/USD".to_string(),
            ContractSide::Buy,
            dec!(2),
            dec!(10),
            dec!(100),
            DEFAULT_MAINTENANCE_MARGIN,
            tp,
            sl,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_liquidation_price() {
        assert_eq!(
            liquidation_price(ContractSide::Buy, dec!(100), dec!(10), dec!(0.005)).unwrap(),
            dec!(90.5)
        );
        assert_eq!(
            liquidation_price(ContractSide::Sell, dec!(100), dec!(10), dec!(0.005)).unwrap(),
            dec!(109.5)
        );
    }

    #[test]
    fn test_margin_used() {
        let pos = long(None, None);
        assert_eq!(pos.margin_used, dec!(20));
    }

    #[test]
    fn test_liquidation_takes_precedence() {
        // A take-profit below the liquidation price is nonsensical but must
        // still lose to liquidation.
        let pos = long(Some(dec!(80)), Some(dec!(95)));
        assert_eq!(pos.check_triggers(dec!(90.4)), Some(CloseTrigger::Liquidation));
    }

    #[test]
    fn test_take_profit_then_stop_loss() {
        let pos = long(Some(dec!(110)), Some(dec!(95)));
        assert_eq!(pos.check_triggers(dec!(110)), Some(CloseTrigger::TakeProfit));
        assert_eq!(pos.check_triggers(dec!(94)), Some(CloseTrigger::StopLoss));
        assert_eq!(pos.check_triggers(dec!(100)), None);
    }

    #[test]
    fn test_short_triggers_mirror() {
        let pos = ContractPosition::open(
            "user-1".to_string(),
            "ETH/USD".to_string(),
            ContractSide::Sell,
            dec!(1),
            dec!(10),
            dec!(100),
            DEFAULT_MAINTENANCE_MARGIN,
            Some(dec!(90)),
            Some(dec!(105)),
            0,
        )
        .unwrap();
        assert_eq!(pos.check_triggers(dec!(109.5)), Some(CloseTrigger::Liquidation));
        assert_eq!(pos.check_triggers(dec!(89)), Some(CloseTrigger::TakeProfit));
        assert_eq!(pos.check_triggers(dec!(106)), Some(CloseTrigger::StopLoss));
        assert_eq!(pos.pnl_at(dec!(90)).unwrap(), dec!(10));
    }

    #[test]
    fn test_settlement_amounts() {
        let pos = long(None, None);

        let close = pos.settlement(dec!(105), CloseTrigger::Manual, dec!(0.01)).unwrap();
        assert_eq!(close.realized_pnl, dec!(10));
        assert_eq!(close.fee, dec!(0.2));
        assert_eq!(close.released, dec!(20));
        assert_eq!(close.credit, dec!(29.8));

        let liq = pos.settlement(dec!(90.4), CloseTrigger::Liquidation, dec!(0.01)).unwrap();
        assert_eq!(liq.realized_pnl, dec!(-19.2));
        assert_eq!(liq.credit, dec!(-19.4));
        assert_eq!(liq.trigger.final_status(), PositionStatus::Liquidated);
    }

    #[test]
    fn test_oversized_position_is_rejected() {
        let err = ContractPosition::open(
            "user-1".to_string(),
            "BTC/USD".to_string(),
            ContractSide::Buy,
            Decimal::MAX / dec!(10),
            Decimal::ONE,
            dec!(100),
            DEFAULT_MAINTENANCE_MARGIN,
            None,
            None,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let mut pos = long(None, None);
        pos.quantity = Decimal::MAX / dec!(10);
        assert!(matches!(pos.pnl_at(dec!(1000)), Err(LedgerError::Validation(_))));
        assert!(pos
            .settlement(dec!(1000), CloseTrigger::Manual, dec!(0.01))
            .is_err());
    }
}
