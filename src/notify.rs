//! Notification contract.
//!
//! The engine emits events; delivery (web push, chat hooks, whatever the
//! deployment wires up) is an external collaborator. Semantics are
//! at-most-once: failures are logged and never retried.
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::Error;
use crate::model::ChangeType;

/// An event the engine wants delivered.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Cookies owned by a watcher are about to expire.
    CookieExpiring {
        watcher_id: i64,
        cookie_count: usize,
        earliest_expiry: OffsetDateTime,
    },
    /// A watcher observed new or modified content.
    WatcherChanged {
        watcher_id: i64,
        change_type: ChangeType,
        new_size: i64,
    },
}

/// Delivery seam implemented by the notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), Error>;
}

/// Deliver best-effort: log and move on when delivery fails.
pub async fn deliver_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(err) = notifier.deliver(&notification).await {
        warn!("notification delivery failed: {}", err);
    }
}

/// Default notifier: writes events to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), Error> {
        info!("notification: {}", serde_json::to_string(notification)?);
        Ok(())
    }
}
