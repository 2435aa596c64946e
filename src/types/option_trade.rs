//! Binary-option trades.

use super::{new_id, round_money};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Multiplier applied to the opening price when a forced outcome needs a
/// displayable expiry price.
const DISPLAY_NUDGE_UP: Decimal = dec!(1.0005);
const DISPLAY_NUDGE_DOWN: Decimal = dec!(0.9995);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionDirection {
    Bullish,
    Bearish,
}

string_enum!(OptionDirection {
    Bullish => "bullish",
    Bearish => "bearish",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionStatus {
    Active,
    ExpiredWin,
    ExpiredLoss,
}

string_enum!(OptionStatus {
    Active => "active",
    ExpiredWin => "expired_win",
    ExpiredLoss => "expired_loss",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    Win,
    Loss,
}

string_enum!(TradeOutcome {
    Win => "win",
    Loss => "loss",
});

/// Outcome forced by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminOutcome {
    Profit,
    Loss,
    /// Coin flip
    Default,
}

string_enum!(AdminOutcome {
    Profit => "profit",
    Loss => "loss",
    Default => "default",
});

/// A binary-option wager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionTrade {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub direction: OptionDirection,
    pub stake: Decimal,
    pub opening_price: Decimal,
    pub purchase_time: i64,
    pub duration_secs: u64,
    pub expiry_time: i64,
    /// Locked at placement from the duration table
    pub return_percentage: Decimal,
    pub status: OptionStatus,
    pub outcome: Option<TradeOutcome>,
    pub expiry_price: Option<Decimal>,
    pub payout: Option<Decimal>,
    pub admin_outcome: Option<AdminOutcome>,
}

/// Result of resolving an expired trade, applied by a guarded transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionResolution {
    pub outcome: TradeOutcome,
    /// Price stored for display; synthesized for forced outcomes
    pub expiry_price: Decimal,
    /// Amount credited to available (stake + profit on a win, zero on a loss)
    pub payout: Decimal,
}

impl OptionResolution {
    pub fn status(&self) -> OptionStatus {
        match self.outcome {
            TradeOutcome::Win => OptionStatus::ExpiredWin,
            TradeOutcome::Loss => OptionStatus::ExpiredLoss,
        }
    }
}

impl OptionTrade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        symbol: String,
        direction: OptionDirection,
        stake: Decimal,
        opening_price: Decimal,
        purchase_time: i64,
        duration_secs: u64,
        return_percentage: Decimal,
    ) -> Self {
        Self {
            id: new_id(),
            user_id,
            symbol,
            direction,
            stake,
            opening_price,
            purchase_time,
            duration_secs,
            expiry_time: purchase_time + (duration_secs as i64) * 1000,
            return_percentage,
            status: OptionStatus::Active,
            outcome: None,
            expiry_price: None,
            payout: None,
            admin_outcome: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time <= now_ms
    }

    /// Stake plus profit at the locked return percentage.
    pub fn win_payout(&self) -> Decimal {
        round_money(self.stake + self.stake * self.return_percentage / dec!(100))
    }

    /// Win iff the market moved strictly in the chosen direction.
    pub fn market_outcome(&self, expiry_price: Decimal) -> TradeOutcome {
        let won = match self.direction {
            OptionDirection::Bullish => expiry_price > self.opening_price,
            OptionDirection::Bearish => expiry_price < self.opening_price,
        };
        if won {
            TradeOutcome::Win
        } else {
            TradeOutcome::Loss
        }
    }

    /// Opening price nudged towards (win) or against (loss) the position.
    pub fn synthesized_price(&self, outcome: TradeOutcome) -> Decimal {
        let factor = match (self.direction, outcome) {
            (OptionDirection::Bullish, TradeOutcome::Win)
            | (OptionDirection::Bearish, TradeOutcome::Loss) => DISPLAY_NUDGE_UP,
            (OptionDirection::Bullish, TradeOutcome::Loss)
            | (OptionDirection::Bearish, TradeOutcome::Win) => DISPLAY_NUDGE_DOWN,
        };
        round_money(self.opening_price * factor)
    }

    /// Decide the outcome. Admin overrides win over the market; `coin_flip`
    /// is only consulted for [`AdminOutcome::Default`].
    pub fn resolve(&self, actual_price: Decimal, coin_flip: impl FnOnce() -> bool) -> OptionResolution {
        let (outcome, expiry_price) = match self.admin_outcome {
            Some(AdminOutcome::Profit) => (TradeOutcome::Win, self.synthesized_price(TradeOutcome::Win)),
            Some(AdminOutcome::Loss) => (TradeOutcome::Loss, self.synthesized_price(TradeOutcome::Loss)),
            Some(AdminOutcome::Default) => {
                let outcome = if coin_flip() {
                    TradeOutcome::Win
                } else {
                    TradeOutcome::Loss
                };
                (outcome, self.synthesized_price(outcome))
            }
            None => (self.market_outcome(actual_price), actual_price),
        };

        let payout = match outcome {
            TradeOutcome::Win => self.win_payout(),
            TradeOutcome::Loss => Decimal::ZERO,
        };

        OptionResolution {
            outcome,
            expiry_price,
            payout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(direction: OptionDirection) -> OptionTrade {
        OptionTrade::new(
            "user-1".to_string(),
            "BTC/USD".to_string(),
            direction,
            dec!(100),
            dec!(50000),
            1_000,
            120,
            dec!(80),
        )
    }

    #[test]
    fn test_expiry_time_from_duration() {
        let t = trade(OptionDirection::Bullish);
        assert_eq!(t.expiry_time, 121_000);
        assert!(!t.is_expired(120_999));
        assert!(t.is_expired(121_000));
    }

    #[test]
    fn test_market_outcome_is_strict() {
        let bull = trade(OptionDirection::Bullish);
        assert_eq!(bull.market_outcome(dec!(50001)), TradeOutcome::Win);
        assert_eq!(bull.market_outcome(dec!(50000)), TradeOutcome::Loss);

        let bear = trade(OptionDirection::Bearish);
        assert_eq!(bear.market_outcome(dec!(49999)), TradeOutcome::Win);
        assert_eq!(bear.market_outcome(dec!(50000)), TradeOutcome::Loss);
    }

    #[test]
    fn test_forced_profit_pays_stake_plus_return() {
        let mut t = trade(OptionDirection::Bearish);
        t.admin_outcome = Some(AdminOutcome::Profit);

        // Market says loss, admin says profit
        let res = t.resolve(dec!(60000), || unreachable!());
        assert_eq!(res.outcome, TradeOutcome::Win);
        assert_eq!(res.payout, dec!(180));
        assert_eq!(res.status(), OptionStatus::ExpiredWin);
        assert!(res.expiry_price < t.opening_price);
    }

    #[test]
    fn test_forced_loss_pays_nothing() {
        let mut t = trade(OptionDirection::Bullish);
        t.admin_outcome = Some(AdminOutcome::Loss);

        let res = t.resolve(dec!(60000), || unreachable!());
        assert_eq!(res.outcome, TradeOutcome::Loss);
        assert_eq!(res.payout, Decimal::ZERO);
        assert_eq!(res.expiry_price, dec!(49975));
    }

    #[test]
    fn test_default_uses_coin_flip() {
        let mut t = trade(OptionDirection::Bullish);
        t.admin_outcome = Some(AdminOutcome::Default);

        let win = t.resolve(dec!(1), || true);
        assert_eq!(win.outcome, TradeOutcome::Win);
        assert_eq!(win.payout, dec!(180));
        assert_eq!(win.expiry_price, dec!(50025));

        let loss = t.resolve(dec!(1_000_000), || false);
        assert_eq!(loss.outcome, TradeOutcome::Loss);
        assert_eq!(loss.payout, Decimal::ZERO);
    }

    #[test]
    fn test_market_resolution_keeps_actual_price() {
        let t = trade(OptionDirection::Bullish);
        let res = t.resolve(dec!(50100.25), || unreachable!());
        assert_eq!(res.outcome, TradeOutcome::Win);
        assert_eq!(res.expiry_price, dec!(50100.25));
    }
}
