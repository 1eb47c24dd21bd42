//! Event bus for sync notifications.

use tokio::sync::broadcast;
use tracing::trace;

use parcelsync_common::RecordKey;

use crate::conflict::ResolutionOrigin;
use crate::state::SyncState;

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A record was written or deleted locally and queued.
    LocalMutation { key: RecordKey },
    StateChanged(SyncState),
    /// The server accepted the record's pending changes.
    DocumentSynced { key: RecordKey, sync_version: u64 },
    /// A conflict was resolved automatically.
    ConflictResolved {
        key: RecordKey,
        origin: ResolutionOrigin,
    },
    ManualReviewRequired { key: RecordKey, conflict_id: String },
    /// A server-side change was applied locally.
    RemoteApplied { key: RecordKey, sync_version: u64 },
}

/// Broadcast fan-out of [`SyncEvent`]s.
///
/// Slow subscribers lag and lose the oldest events rather than blocking
/// publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
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

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let key = RecordKey::new("parcels", "P-1").unwrap();

        bus.publish(SyncEvent::LocalMutation { key: key.clone() });
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::LocalMutation { key });
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(1).publish(SyncEvent::StateChanged(SyncState::Idle));
    }
}
