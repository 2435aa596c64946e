//! TradeLedger - ledger-consistency core for options, contracts, loans and AI robots

pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use config::Config;
use std::sync::Arc;
use websocket::ConnectionRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
}

pub use error::{LedgerError, Result};
