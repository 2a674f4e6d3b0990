//! Toast notifications and persistent system alerts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dispatcher::{Dispatcher, Reducer, StateError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
    Warning,
    Info,
}

impl Level {
    /// How long a toast of this level stays up by default.
    pub fn default_duration(&self) -> Duration {
        match self {
            Level::Error => Duration::from_millis(8000),
            Level::Warning => Duration::from_millis(6000),
            Level::Success | Level::Info => Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    /// Removed automatically after `duration` unless false
    pub auto_remove: bool,
    pub duration: Duration,
}

impl Notification {
    pub fn toast(level: Level, message: impl Into<String>) -> Self {
        Self {
            id: next_id("ntf"),
            level,
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
            auto_remove: true,
            duration: level.default_duration(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::toast(Level::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::toast(Level::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::toast(Level::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::toast(Level::Info, message)
    }

    pub fn persistent(mut self) -> Self {
        self.auto_remove = false;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: String,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SystemAlert {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            id: next_id("alert"),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationState {
    pub notifications: Vec<Notification>,
    pub system_alerts: Vec<SystemAlert>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationAction {
    Add(Notification),
    Remove(String),
    MarkAsRead(String),
    MarkAllRead,
    AddSystemAlert(SystemAlert),
    RemoveSystemAlert(String),
    /// Clears notifications; system alerts stay
    ClearAll,
}

impl Reducer for NotificationState {
    type Action = NotificationAction;

    fn reduce(&mut self, action: NotificationAction) {
        match action {
            NotificationAction::Add(notification) => self.notifications.push(notification),
            NotificationAction::Remove(id) => self.notifications.retain(|n| n.id != id),
            NotificationAction::MarkAsRead(id) => {
                if let Some(n) = self.notifications.iter_mut().find(|n| n.id == id) {
                    n.read = true;
                }
            }
            NotificationAction::MarkAllRead => self.notifications.iter_mut().for_each(|n| n.read = true),
            NotificationAction::AddSystemAlert(alert) => self.system_alerts.push(alert),
            NotificationAction::RemoveSystemAlert(id) => self.system_alerts.retain(|a| a.id != id),
            NotificationAction::ClearAll => self.notifications.clear(),
        }
    }
}

impl NotificationState {
    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }
}

/// Add `notification` and, unless it is persistent, schedule its removal.
/// Returns its id.
pub async fn notify(
    dispatcher: &Dispatcher<NotificationState>,
    notification: Notification,
) -> Result<String, StateError> {
    let id = notification.id.clone();
    let expiry = notification.auto_remove.then_some(notification.duration);
    dispatcher.dispatch(NotificationAction::Add(notification)).await?;

    if let Some(after) = expiry {
        let dispatcher = dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if dispatcher.dispatch(NotificationAction::Remove(id.clone())).await.is_err() {
                debug!(id = %id, "Notification dispatcher gone before auto-removal");
            }
        });
    }
    Ok(id)
}
