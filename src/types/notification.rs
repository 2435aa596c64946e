//! Durable user notifications.

use super::{new_id, now_ms};
use serde::{Deserialize, Serialize};

/// Inbox that receives critical alerts needing manual intervention.
pub const ADMIN_INBOX: &str = "admin";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Critical,
}

string_enum!(NotificationLevel {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// A notification record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    /// Recipient user id, or [`ADMIN_INBOX`]
    pub user_id: String,
    pub level: NotificationLevel,
    pub message: String,
    pub read: bool,
    /// Timestamp in milliseconds
    pub timestamp: i64,
}

impl Notification {
    pub fn new(user_id: &str, level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            level,
            message: message.into(),
            read: false,
            timestamp: now_ms(),
        }
    }
}
