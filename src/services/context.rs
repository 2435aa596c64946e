use crate::error::Result;
use crate::services::ledger::AccountLedger;
use crate::services::notifier::Notifier;
use crate::services::price_feed::PriceFeed;
use crate::services::sqlite_store::{self as db, SqliteStore};
use crate::types::{LedgerEvent, NotificationLevel, SiteSettings};
use crate::websocket::ConnectionRegistry;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

/// Collaborators shared by every settlement service.
#[derive(Clone)]
pub struct LedgerContext {
    pub store: Arc<SqliteStore>,
    pub ledger: AccountLedger,
    pub prices: PriceFeed,
    pub notifier: Arc<dyn Notifier>,
    pub registry: Arc<ConnectionRegistry>,
}

impl LedgerContext {
    pub fn new(
        store: Arc<SqliteStore>,
        prices: PriceFeed,
        notifier: Arc<dyn Notifier>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            ledger: AccountLedger::new(store.clone()),
            store,
            prices,
            notifier,
            registry,
        }
    }

    pub fn settings(&self) -> Result<SiteSettings> {
        self.store.with_conn(db::get_settings)
    }

    /// Admin edit of the settings row. `edit` runs under the write lock and
    /// can veto the change by returning an error.
    pub fn update_settings(
        &self,
        edit: impl FnOnce(&mut SiteSettings) -> Result<()>,
    ) -> Result<SiteSettings> {
        let settings = self.store.with_transaction(|tx| {
            let mut settings = db::get_settings(tx)?;
            edit(&mut settings)?;
            db::save_settings(tx, &settings)?;
            Ok(settings)
        })?;
        info!("Site settings updated");
        Ok(settings)
    }

    /// Undo a reservation after the second step of a lock-then-act flow
    /// failed. A refund that itself fails leaves funds stranded in locked and
    /// is raised as a critical alert.
    pub async fn refund(&self, user_id: &str, amount: Decimal, what: &str) {
        match self.ledger.release(user_id, amount) {
            Ok(_) => info!("Refunded {} to {} after failed {}", amount, user_id, what),
            Err(e) => {
                error!("Refund of {} to {} after failed {} failed: {}", amount, user_id, what, e);
                self.notifier
                    .alert(format!(
                        "Manual intervention: {amount} stuck in locked for {user_id} after failed {what}: {e}"
                    ))
                    .await;
            }
        }
    }

    /// Post-commit side effects. Never fails.
    pub async fn announce(&self, user_id: &str, message: String, event: Option<LedgerEvent>) {
        if let Some(event) = event {
            self.registry.publish(&event);
        }
        self.notifier.notify(user_id, NotificationLevel::Info, message).await;
    }
}
