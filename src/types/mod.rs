//! Domain types for the ledger core.
//!
//! Money is carried as `rust_decimal::Decimal` everywhere and rounded to
//! [`MONEY_DP`] places whenever a rate or percentage is applied.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

/// Generates `as_str`, `Display` and `FromStr` for an enum persisted as text.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

pub mod account;
pub mod contract;
pub mod events;
pub mod loan;
pub mod notification;
pub mod option_trade;
pub mod quote;
pub mod requests;
pub mod robot;
pub mod settings;

pub use account::*;
pub use contract::*;
pub use events::*;
pub use loan::*;
pub use notification::*;
pub use option_trade::*;
pub use quote::*;
pub use requests::*;
pub use robot::*;
pub use settings::*;

/// Decimal places kept on every stored money amount.
pub const MONEY_DP: u32 = 8;

/// Round a computed amount to ledger precision.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp(MONEY_DP)
}

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// UTC calendar day of a millisecond timestamp.
pub fn utc_day(ts_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .date_naive()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
