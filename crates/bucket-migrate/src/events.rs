//! State-change notifications.
//!
//! Every state-affecting change of a migration is published as a
//! [`MigrationEvent`] to a [`NotificationSink`]. The shipped sink is
//! [`EventBus`], an in-process broadcast bus with an explicit
//! subscribe/unsubscribe lifecycle.

use crate::error::Result;
use crate::state::{Migration, MigrationStats, MigrationStatus, Reconciliation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Snapshot of a migration sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationUpdate {
    pub id: String,
    pub status: MigrationStatus,
    pub progress: u8,
    pub stats: MigrationStats,
    pub errors: Vec<String>,
    pub reconciliation: Option<Reconciliation>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Transfer duration in milliseconds.
    pub duration: Option<i64>,
}

impl From<&Migration> for MigrationUpdate {
    fn from(m: &Migration) -> Self {
        Self {
            id: m.id.clone(),
            status: m.status,
            progress: m.progress,
            stats: m.stats,
            errors: m.errors.clone(),
            reconciliation: m.reconciliation.clone(),
            start_time: m.start_time,
            end_time: m.end_time,
            duration: m.duration_ms,
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationEvent {
    MigrationUpdate(MigrationUpdate),
}

impl MigrationEvent {
    pub fn update(migration: &Migration) -> Self {
        MigrationEvent::MigrationUpdate(MigrationUpdate::from(migration))
    }

    pub fn migration_id(&self) -> &str {
        match self {
            MigrationEvent::MigrationUpdate(update) => &update.id,
        }
    }
}

/// Receiver of state-change events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: MigrationEvent) -> Result<()>;

    /// Publish the current state of a migration. Delivery failures are logged
    /// and never reach the caller.
    async fn notify(&self, migration: &Migration) {
        if let Err(e) = self.publish(MigrationEvent::update(migration)).await {
            warn!("Failed to publish update for migration {}: {}", migration.id, e);
        }
    }
}

/// In-process broadcast bus.
pub struct EventBus {
    sender: broadcast::Sender<MigrationEvent>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Events published before this call are not seen.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Subscriber {} attached", id);
        Subscription {
            id,
            receiver: self.sender.subscribe(),
        }
    }

    /// End a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!("Subscriber {} detached", subscription.id);
        drop(subscription);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl NotificationSink for EventBus {
    async fn publish(&self, event: MigrationEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Handle of one subscriber.
pub struct Subscription {
    id: u64,
    receiver: broadcast::Receiver<MigrationEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<MigrationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagged, skipped {} events", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<MigrationEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
