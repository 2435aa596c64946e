//! Best-effort notification sink.

use crate::services::sqlite_store::{self as db, SqliteStore};
use crate::types::{Notification, NotificationLevel, ADMIN_INBOX};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Fire-and-forget delivery. Implementations log their own failures; a
/// delivery problem never reaches the ledger mutation that triggered it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, level: NotificationLevel, message: String);

    /// Raise a critical alert for manual intervention.
    async fn alert(&self, message: String) {
        error!("ALERT: {}", message);
        self.notify(ADMIN_INBOX, NotificationLevel::Critical, message).await;
    }
}

/// Persists notifications to the store so they survive restarts.
pub struct StoreNotifier {
    store: Arc<SqliteStore>,
}

impl StoreNotifier {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn inbox(&self, user_id: &str) -> Vec<Notification> {
        match self.store.with_conn(|c| db::list_notifications(c, user_id)) {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to read notifications for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn notify(&self, user_id: &str, level: NotificationLevel, message: String) {
        let notification = Notification::new(user_id, level, message);
        if let Err(e) = self
            .store
            .with_conn(|c| db::insert_notification(c, &notification))
        {
            warn!("Failed to store notification for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_and_alert_are_stored() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let notifier = StoreNotifier::new(store);

        notifier
            .notify("user-1", NotificationLevel::Info, "hello".to_string())
            .await;
        notifier.alert("loan stuck".to_string()).await;

        let inbox = notifier.inbox("user-1");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message, "hello");

        let admin = notifier.inbox(ADMIN_INBOX);
        assert_eq!(admin.len(), 1);
        assert_eq!(admin[0].level, NotificationLevel::Critical);
    }
}
