//! Site-wide settings read by the settlement routines.

use super::contract::DEFAULT_MAINTENANCE_MARGIN;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DAY_SECS: u64 = 86_400;

/// Rate tables and fees, edited through `LedgerContext::update_settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteSettings {
    /// Option duration in seconds -> return percentage
    pub option_profit_rates: BTreeMap<u64, Decimal>,
    /// Loan term in days -> daily interest rate in percent
    pub loan_term_rates: BTreeMap<u32, Decimal>,
    /// Fraction of notional, e.g. 0.005
    pub maintenance_margin: Decimal,
    /// Fraction of margin charged on close
    pub contract_closing_fee_pct: Decimal,
}

impl Default for SiteSettings {
    fn default() -> Self {
        let option_profit_rates = BTreeMap::from([
            (120, dec!(92)),
            (180, dec!(120)),
            (300, dec!(150)),
            (3 * DAY_SECS, dec!(260)),
            (10 * DAY_SECS, dec!(360)),
            (15 * DAY_SECS, dec!(450)),
        ]);
        Self {
            option_profit_rates,
            loan_term_rates: BTreeMap::new(),
            maintenance_margin: DEFAULT_MAINTENANCE_MARGIN,
            contract_closing_fee_pct: Decimal::ZERO,
        }
    }
}

impl SiteSettings {
    pub fn option_return(&self, duration_secs: u64) -> Option<Decimal> {
        self.option_profit_rates.get(&duration_secs).copied()
    }

    pub fn loan_rate(&self, term_days: u32) -> Option<Decimal> {
        self.loan_term_rates.get(&term_days).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_option_table() {
        let settings = SiteSettings::default();
        assert_eq!(settings.option_return(120), Some(dec!(92)));
        assert_eq!(settings.option_return(15 * 86_400), Some(dec!(450)));
        assert_eq!(settings.option_return(60), None);
        assert_eq!(settings.maintenance_margin, dec!(0.005));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings: SiteSettings =
            serde_json::from_str(r#"{"loanTermRates":{"30":"0.5"},"contractClosingFeePct":"0.001"}"#).unwrap();
        assert_eq!(settings.loan_rate(30), Some(dec!(0.5)));
        assert_eq!(settings.contract_closing_fee_pct, dec!(0.001));
        assert_eq!(settings.option_return(300), Some(dec!(150)));
    }
}
