//! Shared media library models
//!
//! Core item model and the analysis state machine:
//! UNPROCESSED → QUEUED → PROCESSING → {PROCESSED | FAILED},
//! with an explicit re-analyze edge {PROCESSED, FAILED} → QUEUED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Media kind of a library item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Content fingerprint: hash of the item bytes plus modification time.
///
/// A changed fingerprint forces re-analysis; the item id never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 of the item content, hex encoded
    pub content_hash: String,
    /// Modification time (unix epoch milliseconds)
    pub modified_ms: i64,
}

impl Fingerprint {
    pub fn new(content_hash: impl Into<String>, modified_ms: i64) -> Self {
        Self {
            content_hash: content_hash.into(),
            modified_ms,
        }
    }
}

/// Analysis state of a media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingState {
    /// Known to the library, not yet scheduled
    Unprocessed,
    /// Waiting in the analysis queue
    Queued,
    /// Claimed by exactly one worker
    Processing,
    /// All capabilities reached a terminal outcome
    Processed,
    /// Structural failure (content unreadable)
    Failed,
}

impl ProcessingState {
    /// Whether `next` is a legal edge of the processing state machine.
    ///
    /// The only edges are the forward progression and the explicit
    /// re-analyze edge from a terminal state back to QUEUED. Coordinator
    /// operations (cancellation revert, fingerprint reset) restore state
    /// outside this machine and do not go through `can_transition_to`.
    pub fn can_transition_to(self, next: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, next),
            (Unprocessed, Queued)
                | (Queued, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processed, Queued)
                | (Failed, Queued)
        )
    }

    /// Terminal states of one analysis pass
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingState::Processed | ProcessingState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Unprocessed => "UNPROCESSED",
            ProcessingState::Queued => "QUEUED",
            ProcessingState::Processing => "PROCESSING",
            ProcessingState::Processed => "PROCESSED",
            ProcessingState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNPROCESSED" => Some(ProcessingState::Unprocessed),
            "QUEUED" => Some(ProcessingState::Queued),
            "PROCESSING" => Some(ProcessingState::Processing),
            "PROCESSED" => Some(ProcessingState::Processed),
            "FAILED" => Some(ProcessingState::Failed),
            _ => None,
        }
    }
}

/// Analyzer-derived attributes of an item.
///
/// These fields are written only by an atomic analysis commit. The favorite
/// flag lives on [`MediaItem`] directly because it is a user edit, not an
/// analyzer output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAttrs {
    /// Derived tags (e.g. "beach", "food")
    pub tags: BTreeSet<String>,
    /// Recognized text (OCR), empty when none
    pub detected_text: String,
    /// Face cluster ids this item is a member of
    pub face_clusters: BTreeSet<Uuid>,
    /// Geocoded location string
    pub location: Option<String>,
}

impl ItemAttrs {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.detected_text.is_empty()
            && self.face_clusters.is_empty()
            && self.location.is_none()
    }
}

/// A single media library item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    /// Stable identity, immutable for the life of the item
    pub id: Uuid,
    /// Current content fingerprint as reported by the asset source
    pub fingerprint: Fingerprint,
    /// Creation timestamp of the underlying asset
    pub created_at: DateTime<Utc>,
    /// Photo or video
    pub kind: MediaKind,
    /// Committed analyzer-derived attributes
    pub attrs: ItemAttrs,
    /// User favorite flag, independent of analysis state
    pub favorite: bool,
    /// Current processing state
    pub state: ProcessingState,
    /// Fingerprint the committed attrs were derived from, if any
    pub last_analyzed: Option<Fingerprint>,
}

impl MediaItem {
    /// Create a fresh, unprocessed item from source identity data
    pub fn new(
        id: Uuid,
        fingerprint: Fingerprint,
        created_at: DateTime<Utc>,
        kind: MediaKind,
    ) -> Self {
        Self {
            id,
            fingerprint,
            created_at,
            kind,
            attrs: ItemAttrs::default(),
            favorite: false,
            state: ProcessingState::Unprocessed,
            last_analyzed: None,
        }
    }

    /// Whether the committed attrs are stale relative to the current
    /// fingerprint (the item needs re-analysis).
    pub fn needs_analysis(&self) -> bool {
        match &self.last_analyzed {
            Some(fp) => *fp != self.fingerprint,
            None => true,
        }
    }
}
