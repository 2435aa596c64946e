pub mod context;
pub mod contracts;
pub mod funding;
pub mod ledger;
pub mod loans;
pub mod notifier;
pub mod options;
pub mod price_feed;
pub mod quote_cache;
pub mod quote_provider;
pub mod robots;
pub mod scheduler;
pub mod sqlite_store;
#[cfg(test)]
pub(crate) mod testing;

pub use context::LedgerContext;
pub use contracts::{ContractService, PositionView};
pub use funding::FundingService;
pub use ledger::{AccountLedger, Applied, BalanceChange};
pub use loans::{LoanAccrualEngine, LoanService};
pub use notifier::{Notifier, StoreNotifier};
pub use options::OptionService;
pub use price_feed::PriceFeed;
pub use quote_cache::QuoteCache;
pub use quote_provider::QuoteProvider;
pub use robots::RobotService;
pub use scheduler::{retry_transient, spawn_monitor, BatchReport, Monitor};
pub use sqlite_store::SqliteStore;
