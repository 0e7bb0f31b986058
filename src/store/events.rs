use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::branch::BranchId;
use crate::model::version::{UsageKind, VersionId};

/// Notification emitted after a mutation has been applied in full.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    VersionCreated {
        version_id: VersionId,
        branch_id: Option<BranchId>,
    },
    VersionUpdated {
        version_id: VersionId,
    },
    VersionDeleted {
        version_id: VersionId,
    },
    VersionDuplicated {
        source_id: VersionId,
        version_id: VersionId,
    },
    UsageRecorded {
        version_id: VersionId,
        kind: UsageKind,
    },
    BranchCreated {
        branch_id: BranchId,
        name: String,
    },
    BranchRenamed {
        branch_id: BranchId,
        from: String,
        to: String,
    },
    BranchDeleted {
        branch_id: BranchId,
    },
    BranchSwitched {
        branch_id: BranchId,
    },
    BranchRetired {
        branch_id: BranchId,
    },
    SnapshotImported {
        versions: usize,
        branches: usize,
    },
}

/// Fan-out of [`StoreEvent`]s to any number of read-side subscribers.
/// Slow subscribers lag and lose the oldest events; publishers never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StoreEvent) {
        trace!(?event, subscribers = self.subscriber_count(), "publishing store event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
