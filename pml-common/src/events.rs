//! Event types for the PML event system
//!
//! Provides shared event definitions and the EventBus used by the ingest
//! pipeline, the collection materializer, and SSE clients.

use crate::models::ProcessingState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// PML event types
///
/// Events are broadcast via the EventBus and can be serialized for SSE
/// transmission. All pipeline components use this central enum for type
/// safety and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MediaEvent {
    /// Asset source listing was reconciled against the index
    SyncCompleted {
        /// Newly discovered items
        added: usize,
        /// Items whose fingerprint changed (reset for re-analysis)
        changed: usize,
        /// Items no longer present at the source
        removed: usize,
        /// Library size after the sync
        total_items: usize,
        /// When the sync finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A new ingestion batch began (progress counters reset)
    BatchStarted {
        /// Items enqueued for this batch
        total: usize,
        /// When the batch started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An item moved through the processing state machine
    ItemStateChanged {
        /// Item that transitioned
        item_id: Uuid,
        /// State before the transition
        old_state: ProcessingState,
        /// State after the transition
        new_state: ProcessingState,
        /// When the transition happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Analysis results for an item were committed to the index
    ItemCommitted {
        /// Item whose attributes were swapped
        item_id: Uuid,
        /// Index version stamp after the commit
        index_version: u64,
        /// When the commit happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An item ended in FAILED (structural error)
    ItemFailed {
        /// Item that failed
        item_id: Uuid,
        /// Human-readable failure reason
        reason: String,
        /// When the failure was recorded
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch progress update (monotone within a batch)
    IngestProgress {
        /// Items that reached a terminal outcome this batch
        processed: usize,
        /// Total items enqueued this batch
        total: usize,
        /// When the progress was sampled
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// All items of the current batch reached a terminal outcome
    BatchCompleted {
        /// Items processed in the batch
        processed: usize,
        /// When the batch completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Pending and/or in-flight work was cancelled
    IngestCancelled {
        /// Number of items affected
        cancelled: usize,
        /// When the cancellation was applied
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Smart collections were re-evaluated
    CollectionsRecomputed {
        /// Index version the membership sets were computed against
        index_version: u64,
        /// When the recompute finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The index detected an internal consistency violation.
    ///
    /// Fatal to the index; the coordinator reacts by rebuilding from the
    /// asset source plus the stored snapshot.
    IndexCorrupted {
        /// Item whose commit exposed the violation
        item_id: Uuid,
        /// When the violation was detected
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The index was rebuilt from the asset source plus stored snapshot
    IndexRebuilt {
        /// Library size after the rebuild
        item_count: usize,
        /// When the rebuild finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl MediaEvent {
    /// Event type name for SSE event framing
    pub fn event_type(&self) -> &'static str {
        match self {
            MediaEvent::SyncCompleted { .. } => "SyncCompleted",
            MediaEvent::BatchStarted { .. } => "BatchStarted",
            MediaEvent::ItemStateChanged { .. } => "ItemStateChanged",
            MediaEvent::ItemCommitted { .. } => "ItemCommitted",
            MediaEvent::ItemFailed { .. } => "ItemFailed",
            MediaEvent::IngestProgress { .. } => "IngestProgress",
            MediaEvent::BatchCompleted { .. } => "BatchCompleted",
            MediaEvent::IngestCancelled { .. } => "IngestCancelled",
            MediaEvent::CollectionsRecomputed { .. } => "CollectionsRecomputed",
            MediaEvent::IndexCorrupted { .. } => "IndexCorrupted",
            MediaEvent::IndexRebuilt { .. } => "IndexRebuilt",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MediaEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MediaEvent,
    ) -> Result<usize, broadcast::error::SendError<MediaEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: MediaEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
