//! Sync events.
//!
//! Events are fire-and-forget: the engine never waits on a subscriber. A
//! subscriber that falls behind by more than the channel capacity sees
//! `RecvError::Lagged` and skips ahead.

use crate::{
    conflict::{ConflictRecord, Resolution},
    engine::{SyncPhase, SyncReport},
    TableName,
};
use serde::Serialize;
use tokio::sync::broadcast;

/// Something that happened during a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStarted,
    #[serde(rename_all = "camelCase")]
    SyncProgress {
        phase: SyncPhase,
        current: usize,
        total: usize,
        table: Option<TableName>,
    },
    ConflictDetected {
        conflict: ConflictRecord,
    },
    ConflictResolved {
        resolution: Resolution,
    },
    SyncCompleted {
        result: SyncReport,
    },
    SyncFailed {
        error: String,
    },
}

/// Broadcast channel carrying [`SyncEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn emit(&self, event: SyncEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(SyncEvent::SyncStarted), 1);
        bus.emit(SyncEvent::SyncFailed { error: "offline".into() });

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SyncFailed { error: "offline".into() }
        );
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(SyncEvent::SyncStarted), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(SyncEvent::SyncStarted);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted);
    }

    #[test]
    fn events_serialize_with_kebab_tags() {
        let json = serde_json::to_value(SyncEvent::SyncProgress {
            phase: SyncPhase::Uploading,
            current: 1,
            total: 3,
            table: Some("notes".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "sync-progress");
        assert_eq!(json["phase"], "uploading");
    }
}
