//! Session events fanned out to every listener (web clients, CLI watchers).

use mrq_core::RecordId;
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    /// A fetch produced data that differs from the previous snapshot.
    RecordsUpdated {
        changed: Vec<RecordId>,
        removed: Vec<RecordId>,
    },
    QueryChanged {
        page: usize,
    },
    SelectionChanged {
        count: usize,
    },
    /// The next record to review, with the page it sits on.
    Presenting {
        record_id: RecordId,
        page: usize,
    },
    QueueExhausted,
    ActionFailed {
        record_id: RecordId,
        reason: String,
    },
    BatchCompleted {
        succeeded: usize,
        failed: usize,
    },
    Notification {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReviewEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReviewEvent> {
        self.tx.subscribe()
    }

    /// Emits to current subscribers. Having none is not an error.
    pub fn emit(&self, event: ReviewEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
